use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored record failed to encode or decode as CBOR.
    #[error("bad record: {0}")]
    Serialization(String),

    /// The schema on disk cannot be brought to [`CURRENT_VERSION`](crate::migration::CURRENT_VERSION).
    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("store lock poisoned: {0}")]
    Poisoned(String),

    /// A `spawn_blocking` storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
