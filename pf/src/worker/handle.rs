//! Worker handle and its state machine
//!
//! Launching → Idle ⇄ Busy → Crashed → Restarting → Idle, and any state →
//! Terminated. Only the dispatcher moves Idle → Busy; every other transition is
//! made by the supervisor.

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{CommandId, WorkerId};

use super::browser::BrowserIdentity;

/// Worker state; `Busy` carries the command it is executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Launching,
    Idle,
    Busy { command: CommandId },
    Crashed,
    Restarting,
    Terminated,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launching => write!(f, "launching"),
            Self::Idle => write!(f, "idle"),
            Self::Busy { command } => write!(f, "busy({})", command),
            Self::Crashed => write!(f, "crashed"),
            Self::Restarting => write!(f, "restarting"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Pool entry for one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub state: WorkerState,
    pub identity: Option<BrowserIdentity>,
    /// Crashes since the last successful command
    pub consecutive_crashes: u32,
    pub total_crashes: u32,
    pub restarts: u32,
}

impl WorkerHandle {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: WorkerState::Launching,
            identity: None,
            consecutive_crashes: 0,
            total_crashes: 0,
            restarts: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    pub fn is_live(&self) -> bool {
        self.state != WorkerState::Terminated
    }

    pub fn current_command(&self) -> Option<CommandId> {
        match self.state {
            WorkerState::Busy { command } => Some(command),
            _ => None,
        }
    }

    /// Idle → Busy
    pub(crate) fn assign(&mut self, command: CommandId) -> bool {
        if self.state != WorkerState::Idle {
            warn!(worker = %self.id, state = %self.state, %command, "WorkerHandle::assign: worker not idle");
            return false;
        }
        self.state = WorkerState::Busy { command };
        true
    }

    /// Busy → Idle after a finished command, clearing the crash streak
    pub(crate) fn release(&mut self) -> Option<CommandId> {
        let command = self.current_command();
        if command.is_some() {
            self.state = WorkerState::Idle;
            self.consecutive_crashes = 0;
        } else {
            debug!(worker = %self.id, state = %self.state, "WorkerHandle::release: not busy");
        }
        command
    }

    /// Busy → Busy with the next command of a sequence, clearing the crash streak
    pub(crate) fn hand_over(&mut self, next: CommandId) -> bool {
        if self.current_command().is_none() {
            warn!(worker = %self.id, state = %self.state, %next, "WorkerHandle::hand_over: worker not busy");
            return false;
        }
        self.state = WorkerState::Busy { command: next };
        self.consecutive_crashes = 0;
        true
    }

    /// Any live state → Crashed
    pub(crate) fn crash(&mut self) -> Option<CommandId> {
        let command = self.current_command();
        if self.is_live() {
            self.state = WorkerState::Crashed;
            self.consecutive_crashes += 1;
            self.total_crashes += 1;
        }
        command
    }

    /// Crashed → Restarting
    pub(crate) fn restarting(&mut self) {
        if self.state == WorkerState::Crashed {
            self.state = WorkerState::Restarting;
            self.restarts += 1;
        }
    }

    /// Launching/Restarting → Idle
    pub(crate) fn ready(&mut self, identity: BrowserIdentity) -> bool {
        match self.state {
            WorkerState::Launching | WorkerState::Restarting => {
                self.state = WorkerState::Idle;
                self.identity = Some(identity);
                true
            }
            _ => {
                debug!(worker = %self.id, state = %self.state, "WorkerHandle::ready: ignored");
                false
            }
        }
    }

    pub(crate) fn terminate(&mut self) {
        self.state = WorkerState::Terminated;
        self.identity = None;
    }
}
