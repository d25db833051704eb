//! Browser workers
//!
//! A worker owns exactly one browser for the life of the manager and runs one
//! command at a time.

mod browser;
mod error;
mod handle;
mod process;
mod protocol;
mod runner;

pub use browser::{Browser, BrowserFactory, BrowserIdentity, ExecError};
pub use error::WorkerCrashError;
pub use handle::{WorkerHandle, WorkerState};
pub use process::{ProcessBrowser, ProcessBrowserFactory};
pub use protocol::{DriverRequest, DriverResponse};
pub(crate) use runner::{RunnerSettings, WorkerCommand, WorkerEvent, WorkerRunner};
