//! Result types
//!
//! `CommandResult` is what a caller's handle resolves to. `ResultRecord` is the
//! persisted form of one terminal attempt.

use chrono::{DateTime, Utc};
use pagestore::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::command::{CommandKind, CommandStatus};
use super::id::{CommandId, WorkerId};

/// A named piece of captured content (page source, screenshot text, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlob {
    pub name: String,
    pub body: String,
}

/// Data collected by a worker for one command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentBlob>,
}

impl Payload {
    pub fn from_data(data: Value) -> Self {
        Self {
            data,
            content: Vec::new(),
        }
    }
}

/// Why a command did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },

    #[error("storage error: {message}")]
    StorageError { message: String },

    #[error("abandoned on shutdown")]
    Abandoned,

    #[error("no workers available")]
    NoWorkersAvailable,
}

/// Terminal outcome of a command attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            Self::Success => None,
            Self::Failure(reason) => Some(reason),
        }
    }
}

/// What a command handle resolves to
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub status: CommandStatus,
    /// Attempts made (0 when the command never reached a worker)
    pub attempts: u32,
    pub worker_id: Option<WorkerId>,
    pub outcome: Outcome,
    pub payload: Option<Payload>,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Result for a command that never executed
    pub(crate) fn unexecuted(command_id: CommandId, kind: CommandKind, status: CommandStatus, reason: FailureReason) -> Self {
        Self {
            command_id,
            kind,
            status,
            attempts: 0,
            worker_id: None,
            outcome: Outcome::Failure(reason),
            payload: None,
        }
    }
}

/// Persisted outcome of one terminal command attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub session_id: String,
    pub command_id: CommandId,
    pub attempt: u32,
    pub worker_id: WorkerId,
    pub kind: String,
    pub target: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_keys: Vec<String>,
    pub completed_at: DateTime<Utc>,
    pub outcome: Outcome,
}

impl ResultRecord {
    /// Storage key for a named content blob belonging to this attempt
    pub fn content_key(&self, name: &str) -> String {
        format!("{}-{}-{}-{}", self.session_id, self.command_id.0, self.attempt, name)
    }
}

impl Record for ResultRecord {
    fn collection_name() -> &'static str {
        "results"
    }

    fn key(&self) -> String {
        format!("{}:{}:{}", self.session_id, self.command_id.0, self.attempt)
    }
}
