//! Manager-facing errors

use pagestore::StorageError;
use thiserror::Error;

/// Errors returned by the task manager's public operations
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Command queue is full (bound {bound})")]
    QueueFull { bound: usize },

    #[error("Task manager is closed")]
    ManagerClosed,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result alias for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;
