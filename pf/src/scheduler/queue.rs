//! Command queue and dispatch statistics

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use crate::config::RetryPlacement;
use crate::domain::{Command, WorkerId};
use crate::error::{ManagerError, ManagerResult};

/// A command together with the attempt it is about to make
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub command: Command,
    /// 1 for the first execution, incremented on every crash retry
    pub attempt: u32,
    /// Worker of the most recent assignment; None until the command first runs
    pub last_worker: Option<WorkerId>,
}

impl Dispatch {
    pub fn first(command: Command) -> Self {
        Self {
            command,
            attempt: 1,
            last_worker: None,
        }
    }

    /// Whether any earlier attempt already ran on a browser
    pub fn has_run(&self) -> bool {
        self.last_worker.is_some()
    }

    /// The same command, one attempt later
    pub fn retry(mut self) -> Self {
        self.attempt += 1;
        self
    }
}

/// FIFO of commands waiting for an idle worker
///
/// The bound only applies to new submissions; retries always go back in, so a
/// crash never loses a command because the queue filled up in the meantime.
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: VecDeque<Dispatch>,
    bound: Option<usize>,
}

impl CommandQueue {
    pub fn new(bound: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            bound,
        }
    }

    /// Enqueue a newly submitted command at the tail
    pub fn push(&mut self, dispatch: Dispatch) -> ManagerResult<usize> {
        if let Some(bound) = self.bound {
            if self.entries.len() >= bound {
                debug!(bound, id = %dispatch.command.id, "CommandQueue::push: queue full");
                return Err(ManagerError::QueueFull { bound });
            }
        }
        self.entries.push_back(dispatch);
        Ok(self.entries.len())
    }

    /// Put a crashed command back for another attempt
    pub fn requeue(&mut self, dispatch: Dispatch, placement: RetryPlacement) {
        debug!(id = %dispatch.command.id, attempt = dispatch.attempt, ?placement, "CommandQueue::requeue: called");
        match placement {
            RetryPlacement::Head => self.entries.push_front(dispatch),
            RetryPlacement::Tail => self.entries.push_back(dispatch),
        }
    }

    pub fn pop_front(&mut self) -> Option<Dispatch> {
        self.entries.pop_front()
    }

    /// Remove everything, in queue order
    pub fn drain(&mut self) -> Vec<Dispatch> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counters kept by the manager over a session
#[derive(Debug, Default, Clone, Serialize)]
pub struct ManagerStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub retried: u64,
    pub crashes: u64,
    pub restarts: u64,
    pub storage_errors: u64,
    pub peak_queue_depth: usize,
    /// Most commands ever executing at once; never exceeds the pool size
    pub peak_dispatched: usize,
}
