//! Domain types for PageFleet
//!
//! Commands flow through the queue to workers; every terminal attempt produces a
//! ResultRecord that is persisted through the storage provider.

mod command;
mod id;
mod result;

pub use command::{Command, CommandKind, CommandStatus};
pub use id::{CommandId, WorkerId};
pub use result::{CommandResult, ContentBlob, FailureReason, Outcome, Payload, ResultRecord};
