//! Error types for the local store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the local store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested collection does not exist.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// An item failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend rejected a write.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The backend failed to read an item.
    #[error("read failed: {0}")]
    ReadFailed(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
