//! Records for uncommitted local edits and the conflicts they can raise.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::env::EnvCell;
use crate::scope::Scope;
use crate::types::ObjectId;

/// Address of one pending edit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingKey {
    pub env_parent_id: ObjectId,
    pub scope: Scope,
    pub entry_key: String,
}

impl PendingKey {
    pub fn new(env_parent_id: impl Into<ObjectId>, scope: Scope, entry_key: impl Into<String>) -> Self {
        Self {
            env_parent_id: env_parent_id.into(),
            scope,
            entry_key: entry_key.into(),
        }
    }

    /// Stable text form, used as a storage key.
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.env_parent_id, self.scope, self.entry_key)
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// A local edit not yet folded into a changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEnvUpdate {
    pub key: PendingKey,
    /// Authoritative cell when the edit was first made.
    pub base: Option<EnvCell>,
    /// Proposed cell. `None` removes the key.
    pub target: Option<EnvCell>,
    /// Scope version the base was read from.
    pub base_version: u64,
    pub created_at: i64,
}

impl PendingEnvUpdate {
    /// Whether committing this update would change nothing.
    pub fn is_noop(&self) -> bool {
        self.base == self.target
    }
}

/// A pending edit whose base moved to a value other than its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub key: PendingKey,
    pub base: Option<EnvCell>,
    pub local_target: Option<EnvCell>,
    pub authoritative: Option<EnvCell>,
    /// Version the authoritative value was read from.
    pub authoritative_version: u64,
    pub detected_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_includes_scope_text() {
        let key = PendingKey::new("app-1", Scope::locals("app-1", "user-1"), "PORT");
        assert_eq!(key.storage_key(), "app-1/app-1|user-1/PORT");
    }

    #[test]
    fn test_noop_detection() {
        let update = PendingEnvUpdate {
            key: PendingKey::new("app", Scope::environment("dev"), "A"),
            base: Some(EnvCell::value("1")),
            target: Some(EnvCell::value("1")),
            base_version: 3,
            created_at: 0,
        };
        assert!(update.is_noop());
    }
}
