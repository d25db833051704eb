//! Blocking wrapper for callers without an async runtime

use std::sync::Arc;
use std::time::Duration;

use pagestore::StorageProvider;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::config::Config;
use crate::domain::{CommandKind, CommandResult};
use crate::error::{ManagerError, ManagerResult};
use crate::scheduler::ManagerStats;
use crate::worker::BrowserFactory;

use super::{CloseMode, CloseReport, CommandHandle, TaskManager};

/// A [`TaskManager`] driven from synchronous code
///
/// Owns its own multi-thread runtime; must not be used from inside another
/// tokio runtime.
pub struct BlockingTaskManager {
    // dropped before the runtime so background tasks see cancellation first
    inner: TaskManager,
    runtime: Runtime,
}

impl BlockingTaskManager {
    pub fn start(config: Config, storage: Arc<dyn StorageProvider>) -> ManagerResult<Self> {
        let runtime = build_runtime()?;
        let inner = runtime.block_on(TaskManager::start(config, storage))?;
        Ok(Self { inner, runtime })
    }

    pub fn start_with_factory(
        config: Config,
        storage: Arc<dyn StorageProvider>,
        factory: Arc<dyn BrowserFactory>,
    ) -> ManagerResult<Self> {
        let runtime = build_runtime()?;
        let inner = runtime.block_on(TaskManager::start_with_factory(config, storage, factory))?;
        Ok(Self { inner, runtime })
    }

    pub fn submit(&self, kind: CommandKind) -> ManagerResult<CommandHandle> {
        self.inner.submit(kind)
    }

    /// Block until the command is terminal
    pub fn wait(&self, handle: CommandHandle) -> CommandResult {
        self.runtime.block_on(handle.wait())
    }

    /// Visit `url` (plus an optional sleep) and block until both are terminal
    pub fn visit_sync(&self, url: &str, sleep: Option<Duration>) -> ManagerResult<Vec<CommandResult>> {
        debug!(%url, ?sleep, "BlockingTaskManager::visit_sync: called");
        self.runtime.block_on(self.inner.get(url, sleep))
    }

    pub fn close(&self, mode: CloseMode) -> ManagerResult<CloseReport> {
        self.runtime.block_on(self.inner.close(mode))
    }

    pub fn stats(&self) -> ManagerStats {
        self.inner.stats()
    }

    pub fn manager(&self) -> &TaskManager {
        &self.inner
    }
}

fn build_runtime() -> ManagerResult<Runtime> {
    Builder::new_multi_thread()
        .enable_all()
        .thread_name("pagefleet")
        .build()
        .map_err(|e| ManagerError::Configuration(format!("failed to build runtime: {}", e)))
}
