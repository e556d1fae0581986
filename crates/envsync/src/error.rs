//! Error types for the client.

use envsync_core::{CoreError, ObjectId};
use envsync_perms::PermsError;
use envsync_store::StoreError;
use envsync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Data model error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Permission, trust, or envelope error.
    #[error("permission error: {0}")]
    Perms(#[from] PermsError),

    /// Local storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync or server error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The session keyholder is not part of the current graph.
    #[error("session keyholder {0} is not in the org graph")]
    NotLoaded(ObjectId),

    /// A mutation referenced a missing object.
    #[error("unknown object: {0}")]
    UnknownObject(ObjectId),

    /// A mutation is malformed for the current graph.
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    /// Configuration could not be parsed.
    #[error("invalid config: {0}")]
    Config(String),
}

/// The error classes a caller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A key could not be chained to a trusted root. Never retried blindly.
    TrustViolation,
    /// Keys, blobs, or history disagree. The enclosing operation was aborted.
    Integrity,
    /// Rejected before any crypto work.
    PermissionDenied,
    /// Concurrent edits collided; refresh and resolve.
    Conflict,
    /// A referenced object no longer exists.
    StaleReference,
    Other,
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::Perms(e) => perms_category(e),
            ClientError::Sync(e) => match e {
                SyncError::Perms(inner) => perms_category(inner),
                SyncError::VersionConflict { .. } | SyncError::UnresolvedConflict(_) => {
                    ErrorCategory::Conflict
                }
                SyncError::OutOfOrder { .. } | SyncError::InvalidChangeset(_) => ErrorCategory::Integrity,
                SyncError::Core(CoreError::UnknownObject(_) | CoreError::AlreadyDeleted(_)) => {
                    ErrorCategory::StaleReference
                }
                _ => ErrorCategory::Other,
            },
            ClientError::Core(CoreError::UnknownObject(_) | CoreError::AlreadyDeleted(_))
            | ClientError::UnknownObject(_) => ErrorCategory::StaleReference,
            _ => ErrorCategory::Other,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.category() == ErrorCategory::Conflict
    }
}

fn perms_category(e: &PermsError) -> ErrorCategory {
    match e {
        PermsError::TrustViolation { .. } => ErrorCategory::TrustViolation,
        PermsError::PermissionDenied { .. } => ErrorCategory::PermissionDenied,
        PermsError::Integrity(_) | PermsError::DecryptionError(_) => ErrorCategory::Integrity,
        PermsError::Core(CoreError::UnknownObject(_) | CoreError::AlreadyDeleted(_)) => {
            ErrorCategory::StaleReference
        }
        _ => ErrorCategory::Other,
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
