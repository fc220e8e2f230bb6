use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{SinkExt, Stream, StreamExt};
use shared::{
    domain::ConnectionStatus,
    error::{ErrorCode, RemoteError},
    protocol::{ClientFrame, Operation, ServerFrame},
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{info, warn};

use crate::transport::{Bridge, ChannelState, Listener, SessionInfo};

type PendingReply = oneshot::Sender<Result<Vec<u8>, RemoteError>>;

/// [`Bridge`] over one WebSocket carrying JSON [`ClientFrame`]s and
/// [`ServerFrame`]s. Replies are matched to requests by sequence number.
pub struct WsBridge {
    server_url: String,
    request_timeout: Duration,
    next_seq: AtomicU64,
    shared: Arc<Mutex<BridgeState>>,
}

struct BridgeState {
    channel: ChannelState,
    /// Bumped on every open and close so a stale reader cannot tear down a
    /// newer socket.
    generation: u64,
    credentials: Option<(String, String)>,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    reader: Option<JoinHandle<()>>,
    pending: HashMap<u64, PendingReply>,
    listeners: Vec<Listener>,
}

impl WsBridge {
    pub fn new(server_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            server_url: server_url.into(),
            request_timeout,
            next_seq: AtomicU64::new(0),
            shared: Arc::new(Mutex::new(BridgeState {
                channel: ChannelState::Absent,
                generation: 0,
                credentials: None,
                outbound: None,
                reader: None,
                pending: HashMap::new(),
                listeners: Vec::new(),
            })),
        }
    }

    async fn fail_connect(&self, err: RemoteError) -> Result<SessionInfo, RemoteError> {
        let listeners = {
            let mut state = self.shared.lock().await;
            state.channel = ChannelState::Disconnected;
            state.listeners.clone()
        };
        notify_status(&listeners, ConnectionStatus::Disconnected);
        warn!(server_url = %self.server_url, "bridge: connect failed: {err}");
        Err(err)
    }

    /// Closes the current socket, if any, and fails its pending requests.
    async fn close_channel(&self) -> bool {
        let (had_channel, pending) = {
            let mut state = self.shared.lock().await;
            state.generation += 1;
            let had_channel = state.outbound.is_some();
            if let Some(outbound) = state.outbound.take() {
                let _ = outbound.send(WsMessage::Close(None));
            }
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            (had_channel, std::mem::take(&mut state.pending))
        };
        fail_pending(pending, "channel closed");
        had_channel
    }
}

#[async_trait]
impl Bridge for WsBridge {
    async fn connect(&self, app_key: &str, token: &str) -> Result<SessionInfo, RemoteError> {
        self.close_channel().await;
        let listeners = {
            let mut state = self.shared.lock().await;
            state.channel = ChannelState::Connecting;
            state.credentials = Some((app_key.to_string(), token.to_string()));
            state.listeners.clone()
        };
        notify_status(&listeners, ConnectionStatus::Connecting);

        let socket = match timeout(self.request_timeout, connect_async(self.server_url.as_str())).await
        {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(err)) => {
                return self
                    .fail_connect(RemoteError::new(
                        ErrorCode::NetUnavailable,
                        format!("failed to open websocket {}: {err}", self.server_url),
                    ))
                    .await
            }
            Err(_) => {
                return self
                    .fail_connect(RemoteError::new(ErrorCode::Timeout, "websocket open timed out"))
                    .await
            }
        };
        let (mut sink, mut stream) = socket.split();

        let hello = ClientFrame::Connect {
            app_key: app_key.to_string(),
            token: token.to_string(),
        };
        let hello = match serde_json::to_string(&hello) {
            Ok(text) => text,
            Err(err) => {
                return self
                    .fail_connect(RemoteError::new(ErrorCode::Unknown, err.to_string()))
                    .await
            }
        };
        if let Err(err) = sink.send(WsMessage::Text(hello)).await {
            return self
                .fail_connect(RemoteError::new(ErrorCode::NetUnavailable, err.to_string()))
                .await;
        }

        let session = match timeout(self.request_timeout, next_frame(&mut stream)).await {
            Ok(Some(ServerFrame::ConnectAck {
                user_id,
                server_time,
            })) => SessionInfo {
                user_id,
                server_time,
            },
            Ok(Some(ServerFrame::ConnectRejected { code })) => {
                return self
                    .fail_connect(RemoteError::new(code, "server rejected connect"))
                    .await
            }
            Ok(Some(other)) => {
                return self
                    .fail_connect(RemoteError::new(
                        ErrorCode::ProtocolVersion,
                        format!("unexpected handshake frame: {other:?}"),
                    ))
                    .await
            }
            Ok(None) => {
                return self
                    .fail_connect(RemoteError::new(
                        ErrorCode::NetUnavailable,
                        "socket closed during handshake",
                    ))
                    .await
            }
            Err(_) => {
                return self
                    .fail_connect(RemoteError::new(ErrorCode::Timeout, "handshake timed out"))
                    .await
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let listeners = {
            let mut state = self.shared.lock().await;
            state.generation += 1;
            let generation = state.generation;
            let shared = Arc::clone(&self.shared);
            state.reader = Some(tokio::spawn(async move {
                while let Some(frame) = next_frame(&mut stream).await {
                    dispatch_frame(&shared, frame).await;
                }
                channel_lost(&shared, generation).await;
            }));
            state.outbound = Some(outbound_tx);
            state.channel = ChannelState::Connected;
            state.listeners.clone()
        };
        notify_status(&listeners, ConnectionStatus::Connected);
        info!(server_url = %self.server_url, user_id = %session.user_id, "bridge: connected");
        Ok(session)
    }

    async fn reconnect(&self) -> Result<SessionInfo, RemoteError> {
        let credentials = self.shared.lock().await.credentials.clone();
        let Some((app_key, token)) = credentials else {
            return Err(RemoteError::new(
                ErrorCode::NetUnavailable,
                "reconnect before any connect",
            ));
        };
        self.connect(&app_key, &token).await
    }

    async fn disconnect(&self) {
        if !self.close_channel().await {
            return;
        }
        let listeners = {
            let mut state = self.shared.lock().await;
            state.channel = ChannelState::Disconnected;
            state.listeners.clone()
        };
        notify_status(&listeners, ConnectionStatus::Disconnected);
        info!(server_url = %self.server_url, "bridge: disconnected");
    }

    async fn channel_state(&self) -> ChannelState {
        self.shared.lock().await.channel
    }

    async fn request(
        &self,
        op: Operation,
        payload: Vec<u8>,
        target: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = ClientFrame::Request {
            seq,
            op,
            target: target.to_string(),
            payload_b64: STANDARD.encode(payload),
        };
        let text = serde_json::to_string(&frame)
            .map_err(|err| RemoteError::new(ErrorCode::Unknown, err.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = self.shared.lock().await;
            if state.channel != ChannelState::Connected {
                return Err(RemoteError::new(
                    ErrorCode::NetUnavailable,
                    "channel not connected",
                ));
            }
            let Some(outbound) = state.outbound.clone() else {
                return Err(RemoteError::new(ErrorCode::NetUnavailable, "no open socket"));
            };
            state.pending.insert(seq, reply_tx);
            if outbound.send(WsMessage::Text(text)).is_err() {
                state.pending.remove(&seq);
                return Err(RemoteError::new(ErrorCode::NetUnavailable, "socket writer gone"));
            }
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RemoteError::new(
                ErrorCode::NetUnavailable,
                "channel closed before reply",
            )),
            Err(_) => {
                self.shared.lock().await.pending.remove(&seq);
                warn!(seq, ?op, "bridge: request timed out");
                Err(RemoteError::new(
                    ErrorCode::Timeout,
                    format!("{op:?} timed out"),
                ))
            }
        }
    }

    async fn register_listener(&self, listener: Listener) {
        self.shared.lock().await.listeners.push(listener);
    }
}

async fn next_frame<S>(stream: &mut S) -> Option<ServerFrame>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(frame) => return Some(frame),
                Err(err) => warn!("bridge: ignoring invalid server frame: {err}"),
            },
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => {}
            Err(err) => {
                warn!("bridge: socket read failed: {err}");
                return None;
            }
        }
    }
    None
}

async fn dispatch_frame(shared: &Arc<Mutex<BridgeState>>, frame: ServerFrame) {
    match frame {
        ServerFrame::Response { seq, payload_b64 } => {
            let reply = STANDARD.decode(payload_b64).map_err(|err| {
                RemoteError::new(
                    ErrorCode::ProtocolVersion,
                    format!("reply payload is not base64: {err}"),
                )
            });
            resolve(shared, seq, reply).await;
        }
        ServerFrame::Failure { seq, error } => resolve(shared, seq, Err(error)).await,
        ServerFrame::Push { message } => {
            let listeners = shared.lock().await.listeners.clone();
            for listener in &listeners {
                if let Listener::ReceiveMessage(listener) = listener {
                    listener.on_received(message.clone());
                }
            }
        }
        ServerFrame::StatusChanged { status } => {
            let listeners = shared.lock().await.listeners.clone();
            notify_status(&listeners, status);
        }
        ServerFrame::ConnectAck { .. } | ServerFrame::ConnectRejected { .. } => {
            warn!("bridge: ignoring handshake frame on open channel");
        }
    }
}

async fn resolve(shared: &Arc<Mutex<BridgeState>>, seq: u64, reply: Result<Vec<u8>, RemoteError>) {
    let pending = shared.lock().await.pending.remove(&seq);
    match pending {
        Some(reply_tx) => {
            let _ = reply_tx.send(reply);
        }
        None => warn!(seq, "bridge: reply for unknown or expired request"),
    }
}

async fn channel_lost(shared: &Arc<Mutex<BridgeState>>, generation: u64) {
    let (pending, listeners) = {
        let mut state = shared.lock().await;
        if state.generation != generation {
            return;
        }
        state.channel = ChannelState::Disconnected;
        state.outbound = None;
        state.reader = None;
        (std::mem::take(&mut state.pending), state.listeners.clone())
    };
    fail_pending(pending, "socket closed");
    notify_status(&listeners, ConnectionStatus::Disconnected);
    warn!("bridge: socket closed by peer");
}

fn fail_pending(pending: HashMap<u64, PendingReply>, reason: &str) {
    for (_, reply_tx) in pending {
        let _ = reply_tx.send(Err(RemoteError::new(ErrorCode::NetUnavailable, reason)));
    }
}

fn notify_status(listeners: &[Listener], status: ConnectionStatus) {
    for listener in listeners {
        if let Listener::ConnectionStatus(listener) = listener {
            listener.on_changed(status);
        }
    }
}

#[cfg(test)]
#[path = "tests/ws_bridge_tests.rs"]
mod tests;
