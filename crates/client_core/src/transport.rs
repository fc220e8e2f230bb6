use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::ConnectionStatus,
    error::{ErrorCode, RemoteError},
    protocol::{Operation, WireMessage},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user_id: String,
    /// Server clock at connect, in milliseconds.
    pub server_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No channel was ever opened.
    Absent,
    Connecting,
    Connected,
    Disconnected,
}

impl ChannelState {
    pub fn as_connection_status(self) -> ConnectionStatus {
        match self {
            Self::Connected => ConnectionStatus::Connected,
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Absent | Self::Disconnected => ConnectionStatus::Disconnected,
        }
    }
}

pub trait ConnectionStatusListener: Send + Sync {
    fn on_changed(&self, status: ConnectionStatus);
}

pub trait ReceiveMessageListener: Send + Sync {
    fn on_received(&self, message: WireMessage);
}

#[derive(Clone)]
pub enum Listener {
    ConnectionStatus(Arc<dyn ConnectionStatusListener>),
    ReceiveMessage(Arc<dyn ReceiveMessageListener>),
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionStatus(_) => f.write_str("Listener::ConnectionStatus"),
            Self::ReceiveMessage(_) => f.write_str("Listener::ReceiveMessage"),
        }
    }
}

/// The single logical channel to the backend.
///
/// Implementations own reconnect backoff, request correlation and request
/// timeouts; a timeout surfaces as an ordinary `Err` with
/// [`ErrorCode::Timeout`]. Listeners registered through
/// [`Bridge::register_listener`] are kept across reconnects.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn connect(&self, app_key: &str, token: &str) -> Result<SessionInfo, RemoteError>;
    async fn reconnect(&self) -> Result<SessionInfo, RemoteError>;
    async fn disconnect(&self);
    async fn channel_state(&self) -> ChannelState;
    async fn request(
        &self,
        op: Operation,
        payload: Vec<u8>,
        target: &str,
    ) -> Result<Vec<u8>, RemoteError>;
    async fn register_listener(&self, listener: Listener);
}

pub struct MissingBridge;

#[async_trait]
impl Bridge for MissingBridge {
    async fn connect(&self, _app_key: &str, _token: &str) -> Result<SessionInfo, RemoteError> {
        Err(RemoteError::new(
            ErrorCode::NetUnavailable,
            "no transport configured",
        ))
    }

    async fn reconnect(&self) -> Result<SessionInfo, RemoteError> {
        Err(RemoteError::new(
            ErrorCode::NetUnavailable,
            "no transport configured",
        ))
    }

    async fn disconnect(&self) {}

    async fn channel_state(&self) -> ChannelState {
        ChannelState::Absent
    }

    async fn request(
        &self,
        op: Operation,
        _payload: Vec<u8>,
        _target: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        Err(RemoteError::new(
            ErrorCode::NetUnavailable,
            format!("no transport configured for {op:?}"),
        ))
    }

    async fn register_listener(&self, _listener: Listener) {}
}

pub(crate) fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    // Plain data structs; serializing them to JSON cannot fail.
    serde_json::to_vec(value).unwrap_or_default()
}

pub(crate) fn decode_reply<T: DeserializeOwned>(op: Operation, bytes: &[u8]) -> Result<T, RemoteError> {
    serde_json::from_slice(bytes).map_err(|err| {
        RemoteError::new(
            ErrorCode::ProtocolVersion,
            format!("malformed reply to {op:?}: {err}"),
        )
    })
}
