//! Shared session state
//!
//! One `Session` per manager. Everything that moves between queue, pool and
//! waiters lives in [`SessionState`] behind a single mutex that is never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, RetryPlacement};
use crate::domain::{CommandId, CommandResult, CommandStatus, FailureReason, WorkerId};
use crate::scheduler::{CommandQueue, Dispatch, ManagerStats};
use crate::worker::{WorkerCommand, WorkerHandle};

/// Manager lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "lifecycle", rename_all = "snake_case")]
pub enum Lifecycle {
    Starting,
    Running,
    Closing { graceful: bool },
    Closed,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Closing { graceful: true } => write!(f, "closing(graceful)"),
            Self::Closing { graceful: false } => write!(f, "closing(forced)"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A worker's handle and the channel its task listens on
pub(crate) struct WorkerSlot {
    pub handle: WorkerHandle,
    pub tx: mpsc::Sender<WorkerCommand>,
}

pub(crate) struct SessionState {
    pub lifecycle: Lifecycle,
    pub queue: CommandQueue,
    pub workers: Vec<WorkerSlot>,
    /// Commands currently assigned to a worker
    pub inflight: HashMap<CommandId, Dispatch>,
    /// Sequence followers keyed by the command they run after
    pub chained: HashMap<CommandId, Dispatch>,
    /// Completion channels of every command not yet terminal
    pub waiters: HashMap<CommandId, oneshot::Sender<CommandResult>>,
    pub stats: ManagerStats,
}

impl SessionState {
    /// Deliver a terminal result to whoever holds the handle
    pub fn resolve(&mut self, result: CommandResult) {
        debug!(id = %result.command_id, status = %result.status, "SessionState::resolve: called");
        match self.waiters.remove(&result.command_id) {
            // a dropped handle is fine, the command is still terminal
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(id = %result.command_id, "SessionState::resolve: no waiter"),
        }
    }

    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.handle.is_live()).count()
    }

    /// Forced close stops dispatch; graceful close keeps draining the queue
    pub fn accepts_dispatch(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running | Lifecycle::Closing { graceful: true })
    }

    pub fn is_forced_close(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Closing { graceful: false } | Lifecycle::Closed)
    }

    /// Commands accepted but not yet handed to a worker
    pub fn pending(&self) -> usize {
        self.queue.len() + self.chained.len()
    }

    /// Fail everything still waiting once no worker is left to run it
    ///
    /// Commands that never ran are resolved here. Those that already ran on a
    /// browser are returned with their last worker so the caller can record
    /// the attempt.
    pub fn fail_stranded(&mut self) -> Vec<(WorkerId, Dispatch)> {
        if self.live_workers() > 0 || self.pending() == 0 {
            return Vec::new();
        }
        let mut stranded = self.queue.drain();
        stranded.extend(self.chained.drain().map(|(_, dispatch)| dispatch));
        stranded.sort_by_key(|d| d.command.id);
        debug!(count = stranded.len(), "SessionState::fail_stranded: no live workers");

        let mut ran = Vec::new();
        for dispatch in stranded {
            if let Some(worker_id) = dispatch.last_worker {
                ran.push((worker_id, dispatch));
                continue;
            }
            self.stats.failed += 1;
            self.resolve(CommandResult::unexecuted(
                dispatch.command.id,
                dispatch.command.kind,
                CommandStatus::Failed,
                FailureReason::NoWorkersAvailable,
            ));
        }
        ran
    }

    /// Put the next command of a sequence straight onto the worker that ran its predecessor
    ///
    /// Returns the worker's channel and the assignment to send. If the worker
    /// cannot take it the command goes to the head of the queue instead.
    pub fn hand_over(
        &mut self,
        worker_id: WorkerId,
        mut next: Dispatch,
    ) -> Option<(mpsc::Sender<WorkerCommand>, Dispatch)> {
        let id = next.command.id;
        let Some(slot) = self.workers.get_mut(worker_id.0) else {
            self.queue.requeue(next, RetryPlacement::Head);
            return None;
        };
        if !slot.handle.hand_over(id) {
            self.queue.requeue(next, RetryPlacement::Head);
            return None;
        }
        let tx = slot.tx.clone();

        next.command.status = CommandStatus::Dispatched;
        next.last_worker = Some(worker_id);
        self.inflight.insert(id, next.clone());
        self.stats.dispatched += 1;
        self.stats.peak_dispatched = self.stats.peak_dispatched.max(self.inflight.len());
        debug!(%id, worker = %worker_id, "SessionState::hand_over: pinned to worker");
        Some((tx, next))
    }

    /// Abandon every command waiting behind `id` in its sequence
    pub fn abandon_followers(&mut self, id: CommandId) -> Vec<CommandId> {
        let mut abandoned = Vec::new();
        let mut current = id;
        while let Some(next) = self.chained.remove(&current) {
            current = next.command.id;
            self.stats.abandoned += 1;
            abandoned.push(current);
            self.resolve(CommandResult::unexecuted(
                current,
                next.command.kind,
                CommandStatus::Abandoned,
                FailureReason::Abandoned,
            ));
        }
        abandoned
    }

    pub fn record_queue_depth(&mut self) {
        self.stats.peak_queue_depth = self.stats.peak_queue_depth.max(self.queue.len());
    }
}

pub(crate) struct Session {
    pub id: String,
    pub config: Config,
    state: Mutex<SessionState>,
    next_command: AtomicU64,
    dispatch_wake: Notify,
    outstanding: watch::Sender<usize>,
}

impl Session {
    pub fn new(config: Config, workers: Vec<WorkerSlot>) -> Self {
        let id = Uuid::now_v7().to_string();
        debug!(%id, workers = workers.len(), "Session::new: called");
        let queue = CommandQueue::new(config.manager.queue_bound);
        let (outstanding, _) = watch::channel(0);
        Self {
            id,
            config,
            state: Mutex::new(SessionState {
                lifecycle: Lifecycle::Starting,
                queue,
                workers,
                inflight: HashMap::new(),
                chained: HashMap::new(),
                waiters: HashMap::new(),
                stats: ManagerStats::default(),
            }),
            next_command: AtomicU64::new(0),
            dispatch_wake: Notify::new(),
            outstanding,
        }
    }

    /// Lock the session state; a poisoned lock still holds consistent data
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn next_command_id(&self) -> CommandId {
        CommandId(self.next_command.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Publish the outstanding command count
    pub fn publish(&self, state: &SessionState) {
        self.outstanding.send_replace(state.waiters.len());
    }

    pub fn subscribe_outstanding(&self) -> watch::Receiver<usize> {
        self.outstanding.subscribe()
    }

    pub fn wake_dispatcher(&self) {
        self.dispatch_wake.notify_one();
    }

    pub async fn dispatch_wakeup(&self) {
        self.dispatch_wake.notified().await;
    }
}
