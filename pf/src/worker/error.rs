//! Worker crash errors

use std::time::Duration;

use thiserror::Error;

/// A failure that takes a worker's browser down
///
/// These never reach callers directly: the supervisor turns them into retries,
/// and only the final one shows up inside `MaxRetriesExceeded`.
#[derive(Debug, Error)]
pub enum WorkerCrashError {
    #[error("browser failed to launch: {0}")]
    Launch(String),

    #[error("browser process exited: {0}")]
    ProcessExited(String),

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("driver protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker unresponsive: {0}")]
    Unresponsive(String),
}
