//! Envelope addressing: scopes, parts, and key triples.
//!
//! Both [`Scope`] and [`Part`] serialize to their compact text forms so they
//! can be used as map keys in any serde format.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::types::ObjectId;

const LOCALS_SEPARATOR: char = '|';

/// An encryptable scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// A base or sub environment.
    Environment(ObjectId),

    /// One user's locals within an app or block.
    Locals {
        env_parent_id: ObjectId,
        user_id: ObjectId,
    },
}

impl Scope {
    /// Scope of a concrete environment.
    pub fn environment(id: impl Into<ObjectId>) -> Self {
        Scope::Environment(id.into())
    }

    /// Locals scope of `user_id` in `env_parent_id`.
    pub fn locals(env_parent_id: impl Into<ObjectId>, user_id: impl Into<ObjectId>) -> Self {
        Scope::Locals {
            env_parent_id: env_parent_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Whether this is a locals scope.
    pub fn is_locals(&self) -> bool {
        matches!(self, Scope::Locals { .. })
    }

    /// The environment id, for non-locals scopes.
    pub fn environment_id(&self) -> Option<&ObjectId> {
        match self {
            Scope::Environment(id) => Some(id),
            Scope::Locals { .. } => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Environment(id) => write!(f, "{}", id),
            Scope::Locals {
                env_parent_id,
                user_id,
            } => write!(f, "{}{}{}", env_parent_id, LOCALS_SEPARATOR, user_id),
        }
    }
}

impl FromStr for Scope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(LOCALS_SEPARATOR) {
            Some((parent, user)) if !parent.is_empty() && !user.is_empty() => {
                if user.contains(LOCALS_SEPARATOR) {
                    return Err(CoreError::InvalidScope(s.to_string()));
                }
                Ok(Scope::locals(parent, user))
            }
            Some(_) => Err(CoreError::InvalidScope(s.to_string())),
            None if s.is_empty() => Err(CoreError::InvalidScope(s.to_string())),
            None => Ok(Scope::environment(s)),
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The encrypted component of a scope an envelope unlocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Part {
    /// Full values.
    Env,
    /// Keys and cell kinds, without values.
    Meta,
    /// Which keys inherit from which environments.
    Inherits,
    /// One historical changeset.
    Changeset(ObjectId),
    /// Values this scope inherits from a source environment.
    InheritanceOverride(ObjectId),
}

impl Part {
    /// Whether absence of the data key is tolerated when encrypting.
    pub fn is_inheritance_override(&self) -> bool {
        matches!(self, Part::InheritanceOverride(_))
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Part::Env => f.write_str("env"),
            Part::Meta => f.write_str("meta"),
            Part::Inherits => f.write_str("inherits"),
            Part::Changeset(id) => write!(f, "changeset:{}", id),
            Part::InheritanceOverride(id) => write!(f, "override:{}", id),
        }
    }
}

impl FromStr for Part {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "env" => return Ok(Part::Env),
            "meta" => return Ok(Part::Meta),
            "inherits" => return Ok(Part::Inherits),
            _ => {}
        }
        match s.split_once(':') {
            Some(("changeset", id)) if !id.is_empty() => Ok(Part::Changeset(id.into())),
            Some(("override", id)) if !id.is_empty() => Ok(Part::InheritanceOverride(id.into())),
            _ => Err(CoreError::DecodingError(format!("invalid part: {}", s))),
        }
    }
}

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One required envelope: recipient, scope, and part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyTriple {
    pub recipient_id: ObjectId,
    pub scope: Scope,
    pub part: Part,
}

impl KeyTriple {
    pub fn new(recipient_id: impl Into<ObjectId>, scope: Scope, part: Part) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            scope,
            part,
        }
    }
}

impl fmt::Display for KeyTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.recipient_id, self.scope, self.part)
    }
}
