use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure condition reported by the backend or synthesized by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NetUnavailable,
    Timeout,
    TokenIncorrect,
    ProtocolVersion,
    NotAuthorized,
    MessageRejected,
    ConversationRemoveError,
    GroupSyncError,
    GroupMatchError,
    Unknown,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NetUnavailable => "net_unavailable",
            Self::Timeout => "timeout",
            Self::TokenIncorrect => "token_incorrect",
            Self::ProtocolVersion => "protocol_version",
            Self::NotAuthorized => "not_authorized",
            Self::MessageRejected => "message_rejected",
            Self::ConversationRemoveError => "conversation_remove_error",
            Self::GroupSyncError => "group_sync_error",
            Self::GroupMatchError => "group_match_error",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ErrorCode> for RemoteError {
    fn from(code: ErrorCode) -> Self {
        Self {
            code,
            message: String::new(),
        }
    }
}
