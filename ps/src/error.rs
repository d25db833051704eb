//! Storage errors

use thiserror::Error;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store is locked by another process: {0}")]
    Locked(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Store is closed")]
    Closed,
}
