//! Worker task
//!
//! Each worker runs as its own tokio task owning one browser. It only talks to
//! the rest of the manager through channels: assignments come in on its
//! command channel and everything it observes goes out as a [`WorkerEvent`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::domain::{CommandKind, Payload, WorkerId};
use crate::scheduler::Dispatch;
use crate::supervisor::BackoffPolicy;

use super::browser::{Browser, BrowserIdentity, ExecError};
use super::error::WorkerCrashError;

/// Requests sent to a worker task
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Run one command
    Execute(Dispatch),
    /// Tear the browser down and launch a new one after `delay`
    Restart { delay: Duration },
    /// Stop the browser and exit
    Shutdown,
}

/// What a worker reports to the supervisor
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Ready {
        worker_id: WorkerId,
        identity: BrowserIdentity,
    },
    LaunchFailed {
        worker_id: WorkerId,
        error: WorkerCrashError,
    },
    Finished {
        worker_id: WorkerId,
        dispatch: Dispatch,
        result: Result<Payload, ExecError>,
    },
    Stopped {
        worker_id: WorkerId,
    },
}

/// Timing knobs shared by every worker
#[derive(Debug, Clone)]
pub(crate) struct RunnerSettings {
    pub command_timeout: Duration,
    pub grace: Duration,
    pub launch_attempts: u32,
    pub backoff: BackoffPolicy,
}

pub(crate) struct WorkerRunner {
    id: WorkerId,
    browser: Box<dyn Browser>,
    config: BrowserConfig,
    settings: RunnerSettings,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
}

impl WorkerRunner {
    pub fn new(
        id: WorkerId,
        browser: Box<dyn Browser>,
        config: BrowserConfig,
        settings: RunnerSettings,
        commands: mpsc::Receiver<WorkerCommand>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            browser,
            config,
            settings,
            commands,
            events,
            cancel,
        }
    }

    /// Main worker loop; returns once shut down or cancelled
    pub async fn run(mut self) {
        debug!(worker = %self.id, "WorkerRunner::run: called");
        let cancel = self.cancel.clone();

        if self.launch().await {
            loop {
                let command = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(worker = %self.id, "WorkerRunner::run: cancelled while idle");
                        break;
                    }
                    command = self.commands.recv() => command,
                };

                match command {
                    None | Some(WorkerCommand::Shutdown) => {
                        debug!(worker = %self.id, "WorkerRunner::run: shutdown requested");
                        break;
                    }
                    Some(WorkerCommand::Execute(dispatch)) => {
                        let result = tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(worker = %self.id, id = %dispatch.command.id, "WorkerRunner::run: cancelled mid-command");
                                break;
                            }
                            result = self.execute(&dispatch) => result,
                        };
                        let event = WorkerEvent::Finished {
                            worker_id: self.id,
                            dispatch,
                            result,
                        };
                        if self.events.send(event).is_err() {
                            warn!(worker = %self.id, "Supervisor gone, stopping worker");
                            break;
                        }
                    }
                    Some(WorkerCommand::Restart { delay }) => {
                        info!(worker = %self.id, ?delay, "Restarting browser");
                        self.browser.terminate(self.settings.grace).await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        if !self.launch().await {
                            break;
                        }
                    }
                }
            }
        }

        self.browser.terminate(self.settings.grace).await;
        let _ = self.events.send(WorkerEvent::Stopped { worker_id: self.id });
        debug!(worker = %self.id, "WorkerRunner::run: exited");
    }

    /// Launch the browser, retrying with backoff; reports Ready or LaunchFailed
    async fn launch(&mut self) -> bool {
        let cancel = self.cancel.clone();
        let attempts = self.settings.launch_attempts.max(1);
        let timeout = self.config.launch_timeout();
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                self.browser.terminate(self.settings.grace).await;
                let delay = self.settings.backoff.delay(attempt - 1);
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            debug!(worker = %self.id, attempt, "WorkerRunner::launch: launching browser");
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return false,
                outcome = tokio::time::timeout(timeout, self.browser.launch()) => outcome,
            };

            match outcome {
                Ok(Ok(identity)) => {
                    info!(worker = %self.id, pid = ?identity.pid, "Browser launched");
                    let _ = self.events.send(WorkerEvent::Ready {
                        worker_id: self.id,
                        identity,
                    });
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(worker = %self.id, attempt, error = %e, "Browser launch failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(worker = %self.id, attempt, ?timeout, "Browser launch timed out");
                    last_error = Some(WorkerCrashError::Timeout { after: timeout });
                }
            }
        }

        let error = last_error.unwrap_or_else(|| WorkerCrashError::Launch("no launch attempted".to_string()));
        let _ = self.events.send(WorkerEvent::LaunchFailed {
            worker_id: self.id,
            error,
        });
        false
    }

    async fn execute(&mut self, dispatch: &Dispatch) -> Result<Payload, ExecError> {
        debug!(worker = %self.id, id = %dispatch.command.id, attempt = dispatch.attempt, "WorkerRunner::execute: called");
        if !self.browser.is_alive() {
            return Err(WorkerCrashError::ProcessExited("browser not alive before execution".to_string()).into());
        }

        let limit = match &dispatch.command.kind {
            CommandKind::Sleep { duration_ms } => Duration::from_millis(*duration_ms) + self.settings.command_timeout,
            CommandKind::Visit { .. } => self.settings.command_timeout,
        };

        match tokio::time::timeout(limit, self.browser.execute(&dispatch.command.kind)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(worker = %self.id, id = %dispatch.command.id, ?limit, "Command timed out");
                Err(WorkerCrashError::Timeout { after: limit }.into())
            }
        }
    }
}
