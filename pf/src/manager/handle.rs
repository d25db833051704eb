//! Command handles

use tokio::sync::oneshot;

use crate::domain::{CommandId, CommandKind, CommandResult, CommandStatus, FailureReason};

/// Resolves to a command's terminal result
#[derive(Debug)]
pub struct CommandHandle {
    id: CommandId,
    kind: CommandKind,
    rx: oneshot::Receiver<CommandResult>,
}

impl CommandHandle {
    pub(crate) fn new(id: CommandId, kind: CommandKind, rx: oneshot::Receiver<CommandResult>) -> Self {
        Self { id, kind, rx }
    }

    /// A handle that is already terminal
    pub(crate) fn resolved(result: CommandResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let id = result.command_id;
        let kind = result.kind.clone();
        let _ = tx.send(result);
        Self { id, kind, rx }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Wait for the command to reach a terminal state
    ///
    /// A command whose manager went away without resolving it reports
    /// `Abandoned`.
    pub async fn wait(self) -> CommandResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => CommandResult::unexecuted(self.id, self.kind, CommandStatus::Abandoned, FailureReason::Abandoned),
        }
    }

    /// Take the result if it is already available
    pub fn try_result(&mut self) -> Option<CommandResult> {
        self.rx.try_recv().ok()
    }
}
