//! Command domain type
//!
//! A Command is one unit of work submitted to the manager.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::CommandId;

/// What a command asks a worker to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// Load a page in the worker's browser
    Visit { url: String },

    /// Keep the browser idle for a while (lets late requests settle)
    Sleep { duration_ms: u64 },
}

impl CommandKind {
    pub fn visit(url: impl Into<String>) -> Self {
        Self::Visit { url: url.into() }
    }

    pub fn sleep(duration: Duration) -> Self {
        Self::Sleep {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Short label used in records and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Visit { .. } => "visit",
            Self::Sleep { .. } => "sleep",
        }
    }

    /// The command's target: URL for visits, duration for sleeps
    pub fn target(&self) -> String {
        match self {
            Self::Visit { url } => url.clone(),
            Self::Sleep { duration_ms } => format!("{}ms", duration_ms),
        }
    }
}

/// Command lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Waiting in the queue
    #[default]
    Pending,
    /// Assigned to a worker
    Dispatched,
    /// Executed and persisted
    Succeeded,
    /// Terminal failure (see the result's reason)
    Failed,
    /// Dropped by a forced shutdown
    Abandoned,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Abandoned)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// A unit of work. Immutable once issued except for `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    pub issued_at: DateTime<Utc>,
    pub status: CommandStatus,
}

impl Command {
    pub fn new(id: CommandId, kind: CommandKind) -> Self {
        Self {
            id,
            kind,
            issued_at: Utc::now(),
            status: CommandStatus::Pending,
        }
    }
}
