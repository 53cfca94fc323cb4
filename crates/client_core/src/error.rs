use shared::domain::{MessageId, TaskId};
use thiserror::Error;

/// Failures of session operations surfaced to the caller. Realtime problems
/// never show up here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no task is selected")]
    NoActiveTask,
    #[error("nothing to send")]
    EmptySend,
    #[error("message {0} is not in the conversation")]
    UnknownMessage(MessageId),
    #[error("message {0} has not been confirmed yet")]
    Unconfirmed(MessageId),
    #[error("cannot reply to {0}: not a confirmed message of task {1}")]
    InvalidParent(MessageId, TaskId),
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}
