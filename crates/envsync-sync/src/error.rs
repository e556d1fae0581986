//! Error types for the sync module.

use thiserror::Error;

use envsync_core::{PendingKey, Scope};

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The authoritative scope moved past the version a submission was based on.
    #[error("version conflict on {scope}: expected base {expected}, authoritative {actual}")]
    VersionConflict { scope: Scope, expected: u64, actual: u64 },

    /// Changesets for a scope are missing or out of order.
    #[error("changeset out of order on {scope}: expected version {expected}, found {found}")]
    OutOfOrder { scope: Scope, expected: u64, found: u64 },

    /// A changeset document is malformed.
    #[error("invalid changeset: {0}")]
    InvalidChangeset(String),

    /// Edits and resets are not accepted while a scope is committing.
    #[error("scope {0} is committing")]
    ScopeCommitting(Scope),

    /// The key has an unresolved conflict.
    #[error("unresolved conflict on {0}")]
    UnresolvedConflict(PendingKey),

    /// No conflict is recorded for the key.
    #[error("no conflict recorded for {0}")]
    NoSuchConflict(PendingKey),

    /// The server refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The request exceeds a configured size limit.
    #[error("request too large: {count} envelopes, limit {limit}")]
    RequestTooLarge { count: usize, limit: usize },

    /// Timeout waiting for the server.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Permission or cryptographic failure.
    #[error(transparent)]
    Perms(#[from] envsync_perms::PermsError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] envsync_store::StoreError),

    /// Data model error.
    #[error(transparent)]
    Core(#[from] envsync_core::CoreError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
