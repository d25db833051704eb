//! TaskManager - the public face of a crawl session
//!
//! The manager owns the worker pool, the dispatcher and the supervisor for one
//! session:
//! - `submit` enqueues a command and hands back a [`CommandHandle`]
//! - the dispatcher pairs idle workers with queued commands
//! - workers execute and report to the supervisor
//! - the supervisor persists results, retries crashes and restarts browsers
//! - `close` drains or abandons outstanding work and closes storage

mod blocking;
mod handle;
mod session;

pub use blocking::BlockingTaskManager;
pub use handle::CommandHandle;
pub use session::Lifecycle;
pub(crate) use session::{Session, WorkerSlot};

use std::sync::Arc;
use std::time::Duration;

use pagestore::{JsonlStore, StorageProvider};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{Command, CommandId, CommandKind, CommandResult, CommandStatus, FailureReason, WorkerId};
use crate::error::{ManagerError, ManagerResult};
use crate::scheduler::{Dispatch, Dispatcher, ManagerStats};
use crate::supervisor::{BackoffPolicy, Supervisor};
use crate::worker::{
    BrowserFactory, ProcessBrowserFactory, RunnerSettings, WorkerCommand, WorkerHandle, WorkerRunner,
};

/// Worker command channel depth; a worker holds at most one assignment plus control messages
const WORKER_CHANNEL_CAPACITY: usize = 4;

/// How `close` treats outstanding commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseMode {
    /// Finish everything already submitted
    #[default]
    Graceful,
    /// Abandon queued and running commands
    Forced,
}

/// Best-effort summary of a close
#[derive(Debug, Clone, Default)]
pub struct CloseReport {
    /// Queued commands dropped by a forced close
    pub abandoned: Vec<CommandId>,
    /// Commands still running or pending when the workers were stopped
    pub unresolved: Vec<CommandId>,
    pub storage_errors: Vec<String>,
    pub worker_errors: Vec<String>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
            && self.unresolved.is_empty()
            && self.storage_errors.is_empty()
            && self.worker_errors.is_empty()
    }
}

/// Background tasks owned by a running manager
struct Tasks {
    workers: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
    supervisor: JoinHandle<()>,
    worker_cancel: CancellationToken,
    dispatch_shutdown: CancellationToken,
}

/// Manages a pool of browser workers for one session
pub struct TaskManager {
    session: Arc<Session>,
    storage: Arc<dyn StorageProvider>,
    tasks: Mutex<Option<Tasks>>,
}

impl TaskManager {
    /// Start a manager whose workers drive the configured browser binaries
    pub async fn start(config: Config, storage: Arc<dyn StorageProvider>) -> ManagerResult<Self> {
        config.validate()?;
        let factory = ProcessBrowserFactory::new(&config)?;
        Self::start_with_factory(config, storage, Arc::new(factory)).await
    }

    /// Start a manager that stores results as JSONL under the configured database path
    pub async fn start_jsonl(config: Config) -> ManagerResult<Self> {
        config.validate()?;
        let storage = JsonlStore::open(config.database_path())?;
        Self::start(config, Arc::new(storage)).await
    }

    /// Start a manager with a custom browser factory
    pub async fn start_with_factory(
        config: Config,
        storage: Arc<dyn StorageProvider>,
        factory: Arc<dyn BrowserFactory>,
    ) -> ManagerResult<Self> {
        debug!(num_browsers = config.manager.num_browsers, "TaskManager::start_with_factory: called");
        config.validate()?;

        let settings = RunnerSettings {
            command_timeout: config.manager.command_timeout(),
            grace: config.manager.shutdown_timeout() / 2,
            launch_attempts: config.manager.max_restart_attempts,
            backoff: BackoffPolicy::from(&config.manager.backoff),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker_cancel = CancellationToken::new();
        let mut slots = Vec::with_capacity(config.browsers.len());
        let mut runners = Vec::with_capacity(config.browsers.len());

        for (index, browser_config) in config.browsers.iter().enumerate() {
            let worker_id = WorkerId(index);
            let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
            let browser = factory.create(worker_id, browser_config);
            runners.push(WorkerRunner::new(
                worker_id,
                browser,
                browser_config.clone(),
                settings.clone(),
                rx,
                events_tx.clone(),
                worker_cancel.clone(),
            ));
            slots.push(WorkerSlot {
                handle: WorkerHandle::new(worker_id),
                tx,
            });
        }

        let session = Arc::new(Session::new(config, slots));
        let dispatch_shutdown = CancellationToken::new();

        let supervisor = tokio::spawn(Supervisor::new(session.clone(), storage.clone(), events_rx).run());
        let dispatcher = tokio::spawn(Dispatcher::new(session.clone(), events_tx, dispatch_shutdown.clone()).run());
        let workers: Vec<_> = runners.into_iter().map(|r| tokio::spawn(r.run())).collect();

        session.lock().lifecycle = Lifecycle::Running;
        session.wake_dispatcher();
        info!(session = %session.id, workers = workers.len(), "Task manager started");

        Ok(Self {
            session,
            storage,
            tasks: Mutex::new(Some(Tasks {
                workers,
                dispatcher,
                supervisor,
                worker_cancel,
                dispatch_shutdown,
            })),
        })
    }

    /// Enqueue a command; never waits for it to run
    pub fn submit(&self, kind: CommandKind) -> ManagerResult<CommandHandle> {
        debug!(?kind, "TaskManager::submit: called");
        let mut handles = self.submit_sequence(vec![kind])?;
        handles
            .pop()
            .ok_or_else(|| ManagerError::InvalidCommand("empty command sequence".to_string()))
    }

    /// Enqueue commands that run back to back on one browser
    ///
    /// The first command is queued like any other. Each later one waits until
    /// its predecessor is terminal and then runs on the same worker, before
    /// that worker takes anything else from the queue.
    pub fn submit_sequence(&self, kinds: Vec<CommandKind>) -> ManagerResult<Vec<CommandHandle>> {
        debug!(count = kinds.len(), "TaskManager::submit_sequence: called");
        if kinds.is_empty() {
            return Err(ManagerError::InvalidCommand("empty command sequence".to_string()));
        }
        for kind in &kinds {
            validate_command(kind)?;
        }

        let mut state = self.session.lock();
        if matches!(state.lifecycle, Lifecycle::Closing { .. } | Lifecycle::Closed) {
            return Err(ManagerError::ManagerClosed);
        }

        let commands: Vec<Command> = kinds
            .into_iter()
            .map(|kind| Command::new(self.session.next_command_id(), kind))
            .collect();

        if state.live_workers() == 0 {
            warn!(count = commands.len(), "No live workers, failing commands");
            state.stats.submitted += commands.len() as u64;
            state.stats.failed += commands.len() as u64;
            return Ok(commands
                .into_iter()
                .map(|command| {
                    CommandHandle::resolved(CommandResult::unexecuted(
                        command.id,
                        command.kind,
                        CommandStatus::Failed,
                        FailureReason::NoWorkersAvailable,
                    ))
                })
                .collect());
        }

        let mut handles = Vec::with_capacity(commands.len());
        let mut previous: Option<CommandId> = None;
        for command in commands {
            let (id, kind) = (command.id, command.kind.clone());
            match previous {
                None => {
                    state.queue.push(Dispatch::first(command))?;
                }
                Some(before) => {
                    state.chained.insert(before, Dispatch::first(command));
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(id, tx);
            state.stats.submitted += 1;
            handles.push(CommandHandle::new(id, kind, rx));
            previous = Some(id);
        }
        state.record_queue_depth();
        self.session.publish(&state);
        drop(state);

        self.session.wake_dispatcher();
        Ok(handles)
    }

    /// Visit `url`, optionally followed by a sleep on the same browser, and wait for both
    pub async fn get(&self, url: &str, sleep: Option<Duration>) -> ManagerResult<Vec<CommandResult>> {
        debug!(%url, ?sleep, "TaskManager::get: called");
        let mut kinds = vec![CommandKind::visit(url)];
        if let Some(duration) = sleep {
            kinds.push(CommandKind::sleep(duration));
        }

        let mut results = Vec::with_capacity(kinds.len());
        for handle in self.submit_sequence(kinds)? {
            results.push(handle.wait().await);
        }
        Ok(results)
    }

    /// Shut the session down
    ///
    /// Returns once every command is terminal and storage is closed.
    pub async fn close(&self, mode: CloseMode) -> ManagerResult<CloseReport> {
        debug!(?mode, "TaskManager::close: called");
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Err(ManagerError::ManagerClosed);
        };
        info!(session = %self.session.id, ?mode, "Closing task manager");

        let mut report = CloseReport::default();
        let timeout = self.session.config.manager.shutdown_timeout();
        let graceful = mode == CloseMode::Graceful;

        {
            let mut state = self.session.lock();
            state.lifecycle = Lifecycle::Closing { graceful };
            if !graceful {
                let mut pending = state.queue.drain();
                pending.extend(state.chained.drain().map(|(_, dispatch)| dispatch));
                pending.sort_by_key(|d| d.command.id);
                for dispatch in pending {
                    let id = dispatch.command.id;
                    state.stats.abandoned += 1;
                    report.abandoned.push(id);
                    state.resolve(CommandResult::unexecuted(
                        id,
                        dispatch.command.kind,
                        CommandStatus::Abandoned,
                        FailureReason::Abandoned,
                    ));
                }
            }
            self.session.publish(&state);
        }
        self.session.wake_dispatcher();

        if graceful {
            let mut outstanding = self.session.subscribe_outstanding();
            if outstanding.wait_for(|count| *count == 0).await.is_err() {
                warn!("Outstanding command channel closed during drain");
            }
            let senders: Vec<_> = self.session.lock().workers.iter().map(|w| w.tx.clone()).collect();
            for tx in senders {
                if tx.try_send(WorkerCommand::Shutdown).is_err() {
                    debug!("TaskManager::close: worker not accepting shutdown, cancelling");
                    tasks.worker_cancel.cancel();
                }
            }
        } else {
            tasks.worker_cancel.cancel();
        }

        tasks.dispatch_shutdown.cancel();
        if let Err(e) = tasks.dispatcher.await {
            report.worker_errors.push(format!("dispatcher: {}", e));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for (index, mut handle) in tasks.workers.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => report.worker_errors.push(format!("worker-{}: {}", index, e)),
                Err(_) => {
                    warn!(worker = index, ?timeout, "Worker did not stop in time, aborting");
                    handle.abort();
                    let _ = handle.await;
                    report
                        .worker_errors
                        .push(format!("worker-{}: did not stop within {:?}", index, timeout));
                }
            }
        }

        let mut supervisor = tasks.supervisor;
        match tokio::time::timeout(timeout, &mut supervisor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => report.worker_errors.push(format!("supervisor: {}", e)),
            Err(_) => {
                warn!(?timeout, "Supervisor did not finish in time, aborting");
                supervisor.abort();
                report.worker_errors.push("supervisor: did not finish in time".to_string());
            }
        }

        self.abandon_unresolved(&mut report);

        if let Err(e) = self.storage.flush().await {
            warn!(error = %e, "Failed to flush storage");
            report.storage_errors.push(e.to_string());
        }
        if let Err(e) = self.storage.close().await {
            warn!(error = %e, "Failed to close storage");
            report.storage_errors.push(e.to_string());
        }

        {
            let mut state = self.session.lock();
            state.lifecycle = Lifecycle::Closed;
            self.session.publish(&state);
        }
        info!(
            session = %self.session.id,
            abandoned = report.abandoned.len(),
            unresolved = report.unresolved.len(),
            "Task manager closed"
        );
        Ok(report)
    }

    /// Resolve whatever the stopped workers left behind as Abandoned
    fn abandon_unresolved(&self, report: &mut CloseReport) {
        let mut state = self.session.lock();

        let mut leftover: Vec<Dispatch> = state.inflight.drain().map(|(_, d)| d).collect();
        leftover.extend(state.queue.drain());
        leftover.extend(state.chained.drain().map(|(_, d)| d));
        leftover.sort_by_key(|d| d.command.id);

        for dispatch in leftover {
            let id = dispatch.command.id;
            warn!(%id, "Command unresolved at close, abandoning");
            state.stats.abandoned += 1;
            report.unresolved.push(id);
            let mut result = CommandResult::unexecuted(
                id,
                dispatch.command.kind,
                CommandStatus::Abandoned,
                FailureReason::Abandoned,
            );
            result.attempts = dispatch.attempt;
            state.resolve(result);
        }

        // anything left was mid-persist when the supervisor stopped; dropping the
        // sender resolves its handle as Abandoned
        let mut orphaned: Vec<CommandId> = state.waiters.drain().map(|(id, _)| id).collect();
        orphaned.sort();
        state.stats.abandoned += orphaned.len() as u64;
        report.unresolved.extend(orphaned);

        for slot in state.workers.iter_mut() {
            slot.handle.terminate();
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn stats(&self) -> ManagerStats {
        self.session.lock().stats.clone()
    }

    pub fn worker_states(&self) -> Vec<WorkerHandle> {
        self.session.lock().workers.iter().map(|w| w.handle.clone()).collect()
    }

    /// Commands accepted but not yet running
    pub fn pending_count(&self) -> usize {
        self.session.lock().pending()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.session.lock().lifecycle
    }

    pub fn config(&self) -> &Config {
        &self.session.config
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            if let Some(tasks) = tasks.take() {
                debug!("TaskManager::drop: cancelling background tasks without close");
                tasks.dispatch_shutdown.cancel();
                tasks.worker_cancel.cancel();
            }
        }
    }
}

/// Reject commands no browser could run
pub fn validate_command(kind: &CommandKind) -> ManagerResult<()> {
    if let CommandKind::Visit { url } = kind {
        let url = url.trim();
        if url.is_empty() {
            return Err(ManagerError::InvalidCommand("empty URL".to_string()));
        }
        if !url.contains("://") && !url.starts_with("about:") {
            return Err(ManagerError::InvalidCommand(format!("URL has no scheme: {}", url)));
        }
    }
    Ok(())
}
