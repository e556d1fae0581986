//! Permission, trust, and crypto failures.

use std::fmt;

use thiserror::Error;

use envsync_core::ObjectId;

/// Why a keyholder's trust chain could not be verified.
///
/// Each variant names the link where the walk stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustFailure {
    MissingKeyholder(ObjectId),
    Tombstoned(ObjectId),
    MissingPubkey(ObjectId),
    MissingSignature(ObjectId),
    BadSignature(ObjectId),
    Cycle(ObjectId),
    UntrustedRoot(ObjectId),
}

impl TrustFailure {
    /// The chain link the failure refers to.
    pub fn link(&self) -> &ObjectId {
        match self {
            TrustFailure::MissingKeyholder(id)
            | TrustFailure::Tombstoned(id)
            | TrustFailure::MissingPubkey(id)
            | TrustFailure::MissingSignature(id)
            | TrustFailure::BadSignature(id)
            | TrustFailure::Cycle(id)
            | TrustFailure::UntrustedRoot(id) => id,
        }
    }
}

impl fmt::Display for TrustFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustFailure::MissingKeyholder(id) => write!(f, "missing keyholder {}", id),
            TrustFailure::Tombstoned(id) => write!(f, "keyholder {} is tombstoned", id),
            TrustFailure::MissingPubkey(id) => write!(f, "keyholder {} has no pubkey", id),
            TrustFailure::MissingSignature(id) => write!(f, "keyholder {} is unsigned", id),
            TrustFailure::BadSignature(id) => write!(f, "bad signature on {}", id),
            TrustFailure::Cycle(id) => write!(f, "signature cycle at {}", id),
            TrustFailure::UntrustedRoot(id) => write!(f, "root {} is not trusted", id),
        }
    }
}

#[derive(Debug, Error)]
pub enum PermsError {
    /// The actor lacks a permission; raised before any crypto work.
    #[error("permission denied: {actor_id} lacks {permission} on {scope}")]
    PermissionDenied {
        actor_id: ObjectId,
        scope: String,
        permission: envsync_core::Permission,
    },

    /// A keyholder's pubkey is not anchored in a trusted root.
    #[error("trust violation for {keyholder_id}: {reason}")]
    TrustViolation {
        keyholder_id: ObjectId,
        reason: TrustFailure,
    },

    /// Keys and blobs disagree, or required key material is missing.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// An AEAD seal failed.
    #[error("could not encrypt: {0}")]
    EncryptionError(String),

    /// Wrong key, or the ciphertext was tampered with.
    #[error("could not decrypt: {0}")]
    DecryptionError(String),

    #[error("encoding failed: {0}")]
    SerializationError(String),

    /// A crypto worker task failed to run to completion.
    #[error("crypto worker pool: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Core(#[from] envsync_core::CoreError),
}

pub type Result<T> = std::result::Result<T, PermsError>;
