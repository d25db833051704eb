//! Browser abstraction driven by a worker

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::BrowserConfig;
use crate::domain::{CommandKind, Payload, WorkerId};

use super::error::WorkerCrashError;

/// Identity of a launched browser instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserIdentity {
    /// OS process id when process-backed
    pub pid: Option<u32>,
    pub label: String,
}

/// Error from executing one command
#[derive(Debug, Error)]
pub enum ExecError {
    /// The browser is gone or misbehaving; the worker must restart
    #[error(transparent)]
    Crash(#[from] WorkerCrashError),

    /// The browser reported a command-level failure and is still healthy
    #[error("command error: {0}")]
    Command(String),
}

/// One browser instance owned by one worker
///
/// Implementations don't enforce the per-command timeout; the worker wraps
/// every `execute` call in one.
#[async_trait]
pub trait Browser: Send {
    /// Start the browser (also used to restart after `terminate`)
    async fn launch(&mut self) -> Result<BrowserIdentity, WorkerCrashError>;

    /// Execute a single command
    async fn execute(&mut self, command: &CommandKind) -> Result<Payload, ExecError>;

    /// Liveness check, called before every execution
    fn is_alive(&mut self) -> bool;

    /// Stop the browser, escalating after `grace`
    async fn terminate(&mut self, grace: Duration);
}

/// Builds the browser for each worker slot
pub trait BrowserFactory: Send + Sync {
    fn create(&self, worker_id: WorkerId, config: &BrowserConfig) -> Box<dyn Browser>;
}
