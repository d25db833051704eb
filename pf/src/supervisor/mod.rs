//! Crash/retry supervisor
//!
//! A single task consuming [`WorkerEvent`]s. It is the only place results are
//! persisted, so records reach storage in the order commands become terminal.

mod backoff;

pub use backoff::BackoffPolicy;

use std::sync::Arc;

use chrono::Utc;
use pagestore::{Record, StorageError, StorageProvider, to_stored};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RetryPlacement;
use crate::domain::{CommandResult, CommandStatus, FailureReason, Outcome, Payload, ResultRecord, WorkerId};
use crate::manager::Session;
use crate::scheduler::Dispatch;
use crate::worker::{BrowserIdentity, ExecError, WorkerCommand, WorkerCrashError, WorkerEvent};

/// What the supervisor tells a worker after a crash
enum Recovery {
    Restart(std::time::Duration),
    Shutdown,
    Nothing,
}

pub(crate) struct Supervisor {
    session: Arc<Session>,
    storage: Arc<dyn StorageProvider>,
    backoff: BackoffPolicy,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Supervisor {
    pub fn new(
        session: Arc<Session>,
        storage: Arc<dyn StorageProvider>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Self {
        let backoff = BackoffPolicy::from(&session.config.manager.backoff);
        Self {
            session,
            storage,
            backoff,
            events,
        }
    }

    /// Consume events until every sender is gone
    pub async fn run(mut self) {
        debug!("Supervisor::run: called");
        while let Some(event) = self.events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Supervisor::run: event channel closed");
    }

    async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { worker_id, identity } => self.on_ready(worker_id, identity),
            WorkerEvent::LaunchFailed { worker_id, error } => {
                error!(worker = %worker_id, error = %error, "Browser could not be launched, terminating worker");
                self.on_terminated(worker_id).await;
            }
            WorkerEvent::Stopped { worker_id } => {
                debug!(worker = %worker_id, "Supervisor::handle_event: worker stopped");
                self.on_terminated(worker_id).await;
            }
            WorkerEvent::Finished {
                worker_id,
                dispatch,
                result,
            } => match result {
                Ok(payload) => self.on_finished(worker_id, dispatch, Ok(payload)).await,
                Err(ExecError::Command(message)) => {
                    self.on_finished(worker_id, dispatch, Err(FailureReason::CommandFailed { message }))
                        .await
                }
                Err(ExecError::Crash(error)) => self.on_crash(worker_id, dispatch, error).await,
            },
        }
    }

    fn on_ready(&self, worker_id: WorkerId, identity: BrowserIdentity) {
        let mut state = self.session.lock();
        if let Some(slot) = state.workers.get_mut(worker_id.0) {
            if slot.handle.ready(identity) {
                info!(worker = %worker_id, "Worker idle");
            }
        }
        drop(state);
        self.session.wake_dispatcher();
    }

    async fn on_terminated(&self, worker_id: WorkerId) {
        let stranded = {
            let mut state = self.session.lock();
            if let Some(slot) = state.workers.get_mut(worker_id.0) {
                slot.handle.terminate();
            }
            let stranded = state.fail_stranded();
            self.session.publish(&state);
            stranded
        };
        self.fail_stranded(stranded).await;
    }

    /// A command ran to completion, successfully or with a command-level error
    async fn on_finished(&self, worker_id: WorkerId, dispatch: Dispatch, result: Result<Payload, FailureReason>) {
        let id = dispatch.command.id;
        debug!(worker = %worker_id, %id, "Supervisor::on_finished: called");

        let known = self.session.lock().inflight.contains_key(&id);
        if !known {
            debug!(%id, "Supervisor::on_finished: command already abandoned");
            return;
        }

        let (outcome, payload) = match result {
            Ok(payload) => (Outcome::Success, Some(payload)),
            Err(reason) => (Outcome::Failure(reason), None),
        };
        let (outcome, storage_failed) = self.persist(worker_id, &dispatch, outcome, payload.as_ref()).await;

        let next = {
            let mut state = self.session.lock();
            state.inflight.remove(&id);
            let next = if state.accepts_dispatch() {
                match state.chained.remove(&id) {
                    Some(next) => state.hand_over(worker_id, next),
                    None => None,
                }
            } else {
                state.abandon_followers(id);
                None
            };
            if next.is_none() {
                if let Some(slot) = state.workers.get_mut(worker_id.0) {
                    slot.handle.release();
                }
            }

            let status = if outcome.is_success() {
                state.stats.succeeded += 1;
                CommandStatus::Succeeded
            } else {
                state.stats.failed += 1;
                CommandStatus::Failed
            };
            if storage_failed {
                state.stats.storage_errors += 1;
            }

            state.resolve(CommandResult {
                command_id: id,
                kind: dispatch.command.kind,
                status,
                attempts: dispatch.attempt,
                worker_id: Some(worker_id),
                outcome,
                payload,
            });
            self.session.publish(&state);
            next
        };

        if let Some((tx, next)) = next {
            self.send_follower(worker_id, tx, next).await;
        }
        self.session.wake_dispatcher();
    }

    /// Start the next command of a sequence on the worker that just finished
    async fn send_follower(&self, worker_id: WorkerId, tx: mpsc::Sender<WorkerCommand>, next: Dispatch) {
        let id = next.command.id;
        debug!(worker = %worker_id, %id, "Supervisor::send_follower: called");
        let Err(e) = tx.send(WorkerCommand::Execute(next)).await else {
            return;
        };
        warn!(worker = %worker_id, %id, "Worker task gone, queueing sequence follower");
        let WorkerCommand::Execute(next) = e.0 else {
            return;
        };

        // followers only ever wait on their first attempt
        let mut back = Dispatch::first(next.command);
        back.command.status = CommandStatus::Pending;
        let mut state = self.session.lock();
        state.inflight.remove(&id);
        if let Some(slot) = state.workers.get_mut(worker_id.0) {
            slot.handle.release();
        }
        state.queue.requeue(back, RetryPlacement::Head);
        self.session.publish(&state);
    }

    /// The worker's browser went down while running `dispatch`
    async fn on_crash(&self, worker_id: WorkerId, dispatch: Dispatch, crash: WorkerCrashError) {
        let id = dispatch.command.id;
        let last_error = crash.to_string();
        warn!(worker = %worker_id, %id, attempt = dispatch.attempt, error = %last_error, "Worker crashed");

        let manager = &self.session.config.manager;
        let mut to_fail = None;
        let (recovery, tx, stranded) = {
            let mut state = self.session.lock();
            state.stats.crashes += 1;
            let forced = state.is_forced_close();

            let mut recovery = Recovery::Nothing;
            let mut tx = None;
            if let Some(slot) = state.workers.get_mut(worker_id.0) {
                slot.handle.crash();
                tx = Some(slot.tx.clone());
                if slot.handle.consecutive_crashes > manager.max_consecutive_crashes {
                    error!(
                        worker = %worker_id,
                        crashes = slot.handle.consecutive_crashes,
                        "Too many consecutive crashes, terminating worker"
                    );
                    slot.handle.terminate();
                    recovery = Recovery::Shutdown;
                } else if !forced {
                    slot.handle.restarting();
                    let delay = self.backoff.delay(slot.handle.consecutive_crashes.saturating_sub(1));
                    recovery = Recovery::Restart(delay);
                }
            }
            if matches!(recovery, Recovery::Restart(_)) {
                state.stats.restarts += 1;
            }

            if state.inflight.remove(&id).is_none() {
                debug!(%id, "Supervisor::on_crash: command already abandoned");
            } else if forced {
                state.abandon_followers(id);
                state.stats.abandoned += 1;
                state.resolve(CommandResult {
                    command_id: id,
                    kind: dispatch.command.kind.clone(),
                    status: CommandStatus::Abandoned,
                    attempts: dispatch.attempt,
                    worker_id: Some(worker_id),
                    outcome: Outcome::Failure(FailureReason::Abandoned),
                    payload: None,
                });
            } else if dispatch.attempt <= manager.max_retries {
                let mut retry = dispatch.clone().retry();
                retry.command.status = CommandStatus::Pending;
                info!(%id, next_attempt = retry.attempt, "Re-enqueueing crashed command");
                state.queue.requeue(retry, manager.retry_placement);
                state.stats.retried += 1;
                state.record_queue_depth();
            } else {
                // the browser the sequence was pinned to is gone
                if let Some(next) = state.chained.remove(&id) {
                    state.queue.requeue(next, RetryPlacement::Head);
                }
                to_fail = Some(dispatch);
            }

            let stranded = state.fail_stranded();
            self.session.publish(&state);
            (recovery, tx, stranded)
        };

        if let Some(tx) = tx {
            let command = match recovery {
                Recovery::Restart(delay) => Some(WorkerCommand::Restart { delay }),
                Recovery::Shutdown => Some(WorkerCommand::Shutdown),
                Recovery::Nothing => None,
            };
            if let Some(command) = command {
                if tx.send(command).await.is_err() {
                    debug!(worker = %worker_id, "Supervisor::on_crash: worker task already gone");
                }
            }
        }

        if let Some(dispatch) = to_fail {
            self.fail_exhausted(worker_id, dispatch, last_error).await;
        }
        self.fail_stranded(stranded).await;
        self.session.wake_dispatcher();
    }

    /// Persist and resolve commands that ran before but lost every worker
    /// while waiting for their next attempt
    async fn fail_stranded(&self, stranded: Vec<(WorkerId, Dispatch)>) {
        for (worker_id, mut dispatch) in stranded {
            // the queued attempt never started; record the last one that did
            dispatch.attempt = dispatch.attempt.saturating_sub(1).max(1);
            let id = dispatch.command.id;
            warn!(%id, attempts = dispatch.attempt, "No workers left for crashed command");

            let reason = FailureReason::NoWorkersAvailable;
            let (outcome, storage_failed) = self
                .persist(worker_id, &dispatch, Outcome::Failure(reason), None)
                .await;

            let mut state = self.session.lock();
            state.stats.failed += 1;
            if storage_failed {
                state.stats.storage_errors += 1;
            }
            state.resolve(CommandResult {
                command_id: id,
                kind: dispatch.command.kind,
                status: CommandStatus::Failed,
                attempts: dispatch.attempt,
                worker_id: Some(worker_id),
                outcome,
                payload: None,
            });
            self.session.publish(&state);
        }
    }

    /// Persist and resolve a command that crashed on its last allowed attempt
    async fn fail_exhausted(&self, worker_id: WorkerId, dispatch: Dispatch, last_error: String) {
        let id = dispatch.command.id;
        warn!(%id, attempts = dispatch.attempt, "Command exceeded max retries");
        let reason = FailureReason::MaxRetriesExceeded {
            attempts: dispatch.attempt,
            last_error,
        };
        let (outcome, storage_failed) = self
            .persist(worker_id, &dispatch, Outcome::Failure(reason), None)
            .await;

        let mut state = self.session.lock();
        state.stats.failed += 1;
        if storage_failed {
            state.stats.storage_errors += 1;
        }
        state.resolve(CommandResult {
            command_id: id,
            kind: dispatch.command.kind,
            status: CommandStatus::Failed,
            attempts: dispatch.attempt,
            worker_id: Some(worker_id),
            outcome,
            payload: None,
        });
        self.session.publish(&state);
    }

    /// Hand the attempt's record and content to storage
    ///
    /// Returns the outcome to report: a storage failure replaces whatever the
    /// attempt produced.
    async fn persist(
        &self,
        worker_id: WorkerId,
        dispatch: &Dispatch,
        outcome: Outcome,
        payload: Option<&Payload>,
    ) -> (Outcome, bool) {
        let mut record = ResultRecord {
            session_id: self.session.id.clone(),
            command_id: dispatch.command.id,
            attempt: dispatch.attempt,
            worker_id,
            kind: dispatch.command.kind.label().to_string(),
            target: dispatch.command.kind.target(),
            payload: payload.map(|p| p.data.clone()).unwrap_or(Value::Null),
            content_keys: Vec::new(),
            completed_at: Utc::now(),
            outcome,
        };

        match self.write_record(&mut record, payload).await {
            Ok(()) => (record.outcome, false),
            Err(e) => {
                error!(id = %dispatch.command.id, attempt = dispatch.attempt, error = %e, "Failed to persist result");
                let reason = FailureReason::StorageError { message: e.to_string() };
                (Outcome::Failure(reason), true)
            }
        }
    }

    async fn write_record(&self, record: &mut ResultRecord, payload: Option<&Payload>) -> Result<(), StorageError> {
        if let Some(payload) = payload {
            for blob in &payload.content {
                let key = record.content_key(&blob.name);
                self.storage.save_content(&key, blob.body.as_bytes()).await?;
                record.content_keys.push(key);
            }
        }
        let written = self.storage.save(vec![to_stored(&*record)?]).await?;
        debug!(key = %record.key(), written, "Supervisor::write_record: saved");
        Ok(())
    }
}
