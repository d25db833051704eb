//! PageFleet - a supervised pool of browser workers
//!
//! A [`TaskManager`] runs a fixed-size pool of workers, each owning one
//! browser. Commands (page visits, sleeps) are queued in submission order and
//! dispatched to idle workers. When a browser crashes or hangs, the supervisor
//! restarts it with backoff and retries the command up to a configured limit.
//! Every terminal attempt is persisted through a [`pagestore::StorageProvider`].
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use pagefleet::{CloseMode, Config, TaskManager};
//! use pagestore::JsonlStore;
//!
//! let config = Config::load_default_params(2);
//! let storage = Arc::new(JsonlStore::open(config.database_path())?);
//! let manager = TaskManager::start(config, storage).await?;
//! let results = manager.get("http://example.com/", None).await?;
//! manager.close(CloseMode::Graceful).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod manager;
pub mod scheduler;
pub mod supervisor;
pub mod util;
pub mod worker;

pub use config::{BackoffConfig, BackoffKind, BrowserConfig, Config, DisplayMode, ManagerConfig, RetryPlacement};
pub use domain::{
    Command, CommandId, CommandKind, CommandResult, CommandStatus, FailureReason, Outcome, Payload, ResultRecord,
    WorkerId,
};
pub use error::{ManagerError, ManagerResult};
pub use manager::{BlockingTaskManager, CloseMode, CloseReport, CommandHandle, Lifecycle, TaskManager};
pub use scheduler::ManagerStats;
pub use worker::{Browser, BrowserFactory, BrowserIdentity, ExecError, WorkerCrashError, WorkerHandle, WorkerState};
