//! Error types for envsync core.

use thiserror::Error;

use crate::types::ObjectId;

/// Core errors raised by the data model.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("unknown object: {0}")]
    UnknownObject(ObjectId),

    #[error("object {0} is already tombstoned")]
    AlreadyDeleted(ObjectId),

    #[error("object {id} has kind {actual}, expected {expected}")]
    WrongKind {
        id: ObjectId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
