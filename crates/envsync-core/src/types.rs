//! Strong type definitions for envsync.
//!
//! Graph objects are addressed by opaque string ids. Every object carries the
//! same [`ObjectMeta`] header so tombstoning and timestamps work uniformly.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Identifier of an object in the org graph.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Create an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id (16 random bytes, hex encoded).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ObjectId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Header shared by every graph object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// The object's id.
    pub id: ObjectId,

    /// Creation time (Unix milliseconds).
    pub created_at: i64,

    /// Last in-place update (Unix milliseconds).
    pub updated_at: i64,

    /// Tombstone marker. Tombstoned objects stay in the graph.
    pub deleted_at: Option<i64>,
}

impl ObjectMeta {
    /// Create a live header.
    pub fn new(id: impl Into<ObjectId>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    /// Whether the object has been tombstoned.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
