use shared::{
    domain::Message,
    error::{ErrorCode, RemoteError},
};
use thiserror::Error;

use crate::content::ContentError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad argument shape or range; nothing was sent or stored.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),
    /// No channel, or a channel whose socket is not connected.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(ErrorCode),
    #[error("remote rejected request: {0}")]
    RemoteRejected(RemoteError),
    #[error("roster synchronization failed: {0}")]
    RosterSyncFailed(RemoteError),
    #[error("local store failure: {0:#}")]
    Store(anyhow::Error),
    #[error(transparent)]
    Content(#[from] ContentError),
}

impl EngineError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::TransportUnavailable(code) => Some(*code),
            Self::RemoteRejected(err) | Self::RosterSyncFailed(err) => Some(err.code),
            Self::PreconditionViolation(_) | Self::Store(_) | Self::Content(_) => None,
        }
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionViolation(message.into())
    }
}

/// Failure of one send call. `message` is present once the message was
/// persisted locally, i.e. for every failure after the network request was
/// issued; it then carries `SentStatus::Failed`.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SendError {
    pub error: EngineError,
    pub message: Option<Message>,
}

impl SendError {
    pub(crate) fn rejected(error: EngineError) -> Self {
        Self {
            error,
            message: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("token rejected by server")]
    TokenIncorrect,
    #[error("connect failed: {0}")]
    Failed(RemoteError),
}
