//! Dispatcher task
//!
//! Pairs idle workers with the head of the queue whenever it is woken.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{CommandStatus, WorkerId};
use crate::manager::Session;
use crate::worker::{ExecError, WorkerCommand, WorkerCrashError, WorkerEvent};

use super::queue::Dispatch;

pub(crate) struct Dispatcher {
    session: Arc<Session>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>, events: mpsc::UnboundedSender<WorkerEvent>, shutdown: CancellationToken) -> Self {
        Self {
            session,
            events,
            shutdown,
        }
    }

    pub async fn run(self) {
        debug!("Dispatcher::run: called");
        loop {
            self.dispatch_ready().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.session.dispatch_wakeup() => {}
            }
        }
        debug!("Dispatcher::run: exited");
    }

    /// Assign as many queued commands as there are idle workers
    async fn dispatch_ready(&self) {
        let assignments = {
            let mut state = self.session.lock();
            let mut assignments = Vec::new();
            if !state.accepts_dispatch() {
                return;
            }

            while !state.queue.is_empty() {
                let Some(index) = state.workers.iter().position(|w| w.handle.is_idle()) else {
                    break;
                };
                let Some(mut dispatch) = state.queue.pop_front() else {
                    break;
                };
                let id = dispatch.command.id;
                dispatch.command.status = CommandStatus::Dispatched;
                dispatch.last_worker = Some(WorkerId(index));
                state.workers[index].handle.assign(id);
                state.inflight.insert(id, dispatch.clone());
                state.stats.dispatched += 1;
                state.stats.peak_dispatched = state.stats.peak_dispatched.max(state.inflight.len());

                debug!(%id, worker = index, attempt = dispatch.attempt, "Dispatcher::dispatch_ready: assigned");
                assignments.push((WorkerId(index), state.workers[index].tx.clone(), dispatch));
            }
            assignments
        };

        for (worker_id, tx, dispatch) in assignments {
            if let Err(e) = tx.send(WorkerCommand::Execute(dispatch)).await {
                if let WorkerCommand::Execute(dispatch) = e.0 {
                    self.report_lost(worker_id, dispatch);
                }
            }
        }
    }

    fn report_lost(&self, worker_id: WorkerId, dispatch: Dispatch) {
        warn!(worker = %worker_id, id = %dispatch.command.id, "Worker task gone, reporting crash");
        let event = WorkerEvent::Finished {
            worker_id,
            dispatch,
            result: Err(ExecError::Crash(WorkerCrashError::Unresponsive(
                "worker task is no longer running".to_string(),
            ))),
        };
        if self.events.send(event).is_err() {
            warn!(worker = %worker_id, "Supervisor gone, crash report dropped");
        }
    }
}
