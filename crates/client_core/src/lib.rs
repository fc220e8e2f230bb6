use std::sync::Arc;

use reqwest::Client;
use serde_json::Value;
use shared::{
    domain::{
        ConnectionStatus, Conversation, ConversationKey, ConversationType, Discussion,
        LocalMessageId, PublicServiceProfile, ReceivedStatus, SentStatus, UserInfo,
    },
    error::{ErrorCode, RemoteError},
    protocol::{Operation, RelationsRequest, RelationsResponse, RemoveConversationRequest},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

pub mod config;
pub mod content;
pub mod conversations;
mod durable_store;
pub mod error;
mod history;
mod public_service;
mod roster;
mod send;
pub mod store;
pub mod transport;
pub mod watermark;
mod ws_bridge;

pub use config::ClientSettings;
pub use durable_store::DurableLocalStore;
pub use error::{ConnectError, EngineError, SendError};
pub use history::MAX_HISTORY_PAGE;
pub use roster::{dedup_groups, roster_fingerprint, RosterSyncOutcome};
pub use store::{HistoryPage, LocalStore, MemoryStore};
pub use transport::{Bridge, ChannelState, Listener, MissingBridge, SessionInfo};
pub use ws_bridge::WsBridge;

use content::{ContentRegistry, ContentTypeRegistration};
use conversations::ConversationCache;
use transport::{
    decode_reply, encode_payload, ConnectionStatusListener, ReceiveMessageListener,
};
use watermark::WatermarkTracker;

/// `relation_type` asking the backend for the caller's conversations.
const CONVERSATION_RELATIONS: i32 = 1;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Synchronization engine for one signed-in identity.
///
/// Owns the conversation cache and both watermark maps; the transport and
/// the local store are injected. No lock is held across a bridge request,
/// so concurrent operations on the same conversation interleave and the
/// last one to settle wins for every field it writes.
pub struct ImClient {
    app_key: String,
    api_base_url: String,
    http: Client,
    bridge: Arc<dyn Bridge>,
    store: Arc<dyn LocalStore>,
    registry: RwLock<ContentRegistry>,
    inner: Mutex<ClientState>,
}

struct ClientState {
    session: Option<SessionInfo>,
    delta_time: i64,
    listeners_attached: bool,
    pending_listeners: Vec<Listener>,
    conversations: ConversationCache,
    conversations_loaded: bool,
    history_watermarks: WatermarkTracker,
    forward_watermarks: WatermarkTracker,
    public_services: Vec<PublicServiceProfile>,
}

impl ImClient {
    pub fn new(settings: &ClientSettings) -> Arc<Self> {
        Self::new_with_dependencies(
            settings,
            Arc::new(MissingBridge),
            Arc::new(MemoryStore::new()),
        )
    }

    pub fn new_with_dependencies(
        settings: &ClientSettings,
        bridge: Arc<dyn Bridge>,
        store: Arc<dyn LocalStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            app_key: settings.app_key.clone(),
            api_base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            http: Client::new(),
            bridge,
            store,
            registry: RwLock::new(ContentRegistry::with_builtins()),
            inner: Mutex::new(ClientState {
                session: None,
                delta_time: 0,
                listeners_attached: false,
                pending_listeners: Vec::new(),
                conversations: ConversationCache::default(),
                conversations_loaded: false,
                history_watermarks: WatermarkTracker::new(settings.watermark_capacity),
                forward_watermarks: WatermarkTracker::new(settings.watermark_capacity),
                public_services: Vec::new(),
            }),
        })
    }

    /// Wires a [`WsBridge`] and, when a database is configured, a
    /// [`DurableLocalStore`].
    pub async fn from_settings(settings: &ClientSettings) -> anyhow::Result<Arc<Self>> {
        let bridge = Arc::new(WsBridge::new(
            settings.server_url.clone(),
            settings.request_timeout(),
        ));
        let store: Arc<dyn LocalStore> =
            match config::normalize_database_url(&settings.database_url) {
                Some(database_url) => DurableLocalStore::initialize(&database_url).await?,
                None => Arc::new(MemoryStore::new()),
            };
        Ok(Self::new_with_dependencies(settings, bridge, store))
    }

    pub async fn register_message_type(
        &self,
        registration: ContentTypeRegistration,
    ) -> Result<(), EngineError> {
        let message_type = registration.message_type.clone();
        self.registry.write().await.register(registration)?;
        info!(%message_type, "content: registered message type");
        Ok(())
    }

    // Connection lifecycle

    /// Opens the channel. Listeners queued before this call are handed to
    /// the bridge once, on the first attempt, whatever its outcome.
    pub async fn connect(&self, token: &str) -> Result<SessionInfo, ConnectError> {
        self.flush_pending_listeners().await;
        info!(app_key = %self.app_key, "connect: opening channel");
        let result = self.bridge.connect(&self.app_key, token).await;
        self.settle_connect(result).await
    }

    pub async fn reconnect(&self) -> Result<SessionInfo, ConnectError> {
        info!("connect: reconnecting channel");
        let result = self.bridge.reconnect().await;
        self.settle_connect(result).await
    }

    async fn settle_connect(
        &self,
        result: Result<SessionInfo, RemoteError>,
    ) -> Result<SessionInfo, ConnectError> {
        match result {
            Ok(session) => {
                let mut guard = self.inner.lock().await;
                guard.delta_time = session.server_time - now_millis();
                guard.session = Some(session.clone());
                info!(
                    user_id = %session.user_id,
                    delta_time = guard.delta_time,
                    "connect: session established"
                );
                Ok(session)
            }
            Err(err) if err.code == ErrorCode::TokenIncorrect => {
                warn!("connect: token rejected: {err}");
                Err(ConnectError::TokenIncorrect)
            }
            Err(err) => {
                warn!("connect: failed: {err}");
                Err(ConnectError::Failed(err))
            }
        }
    }

    pub async fn disconnect(&self) {
        self.bridge.disconnect().await;
        info!("connect: channel closed");
    }

    /// Disconnects and forgets the signed-in identity. Cache and watermarks
    /// are kept.
    pub async fn logout(&self) {
        self.bridge.disconnect().await;
        self.inner.lock().await.session = None;
        info!("connect: logged out");
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.bridge.channel_state().await.as_connection_status()
    }

    pub async fn current_user_id(&self) -> Option<String> {
        let guard = self.inner.lock().await;
        guard.session.as_ref().map(|session| session.user_id.clone())
    }

    /// Server clock minus local clock at the last successful connect, in ms.
    pub async fn delta_time(&self) -> i64 {
        self.inner.lock().await.delta_time
    }

    pub async fn set_connection_status_listener(&self, listener: Arc<dyn ConnectionStatusListener>) {
        self.add_listener(Listener::ConnectionStatus(listener)).await;
    }

    pub async fn set_receive_message_listener(&self, listener: Arc<dyn ReceiveMessageListener>) {
        self.add_listener(Listener::ReceiveMessage(listener)).await;
    }

    async fn add_listener(&self, listener: Listener) {
        {
            let mut guard = self.inner.lock().await;
            if !guard.listeners_attached {
                guard.pending_listeners.push(listener);
                return;
            }
        }
        self.bridge.register_listener(listener).await;
    }

    async fn flush_pending_listeners(&self) {
        let pending = {
            let mut guard = self.inner.lock().await;
            if guard.listeners_attached {
                return;
            }
            guard.listeners_attached = true;
            std::mem::take(&mut guard.pending_listeners)
        };
        for listener in pending {
            self.bridge.register_listener(listener).await;
        }
    }

    // Conversation cache

    async fn ensure_conversations_loaded(&self) {
        if self.inner.lock().await.conversations_loaded {
            return;
        }
        match self.store.get_conversation_list(None).await {
            Ok(stored) => {
                let mut guard = self.inner.lock().await;
                for conversation in stored {
                    guard.conversations.insert_if_absent(conversation);
                }
                guard.conversations_loaded = true;
            }
            Err(err) => warn!("conversations: failed to load from store: {err:#}"),
        }
    }

    async fn persist_conversation(&self, conversation: &Conversation) {
        if let Err(err) = self.store.add_conversation(conversation).await {
            error!(key = %conversation.key, "conversations: failed to persist: {err:#}");
        }
    }

    /// Pinned first, then most recent first. A filter returns a view in the
    /// same order.
    pub async fn list_conversations(
        &self,
        filter: Option<&[ConversationType]>,
    ) -> Vec<Conversation> {
        self.ensure_conversations_loaded().await;
        self.inner.lock().await.conversations.list(filter)
    }

    pub async fn get_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, EngineError> {
        if let Some(cached) = self.inner.lock().await.conversations.get(key).cloned() {
            return Ok(Some(cached));
        }
        let stored = self
            .store
            .get_conversation(key)
            .await
            .map_err(EngineError::Store)?;
        if let Some(conversation) = &stored {
            self.inner
                .lock()
                .await
                .conversations
                .insert_if_absent(conversation.clone());
        }
        Ok(stored)
    }

    /// Returns the existing conversation for `key`, or creates an empty one.
    pub async fn create_conversation(&self, key: ConversationKey, title: &str) -> Conversation {
        let (conversation, created) = {
            let mut guard = self.inner.lock().await;
            let (conversation, created) = guard.conversations.get_or_create(&key);
            if created {
                conversation.title = title.to_string();
            }
            (conversation.clone(), created)
        };
        if created {
            self.persist_conversation(&conversation).await;
        }
        conversation
    }

    /// Removes the conversation on the server, then locally.
    pub async fn remove_conversation(&self, key: &ConversationKey) -> Result<(), EngineError> {
        let removal_failed = |message: String| {
            EngineError::RemoteRejected(RemoteError::new(
                ErrorCode::ConversationRemoveError,
                message,
            ))
        };
        let request = RemoveConversationRequest {
            conversation_type: key.conversation_type,
        };
        self.bridge
            .request(
                Operation::RemoveConversation,
                encode_payload(&request),
                &key.target_id,
            )
            .await
            .map_err(|err| removal_failed(err.to_string()))?;
        self.store
            .remove_conversation(key)
            .await
            .map_err(|err| removal_failed(format!("{err:#}")))?;
        self.inner.lock().await.conversations.remove(key);
        info!(%key, "conversations: removed");
        Ok(())
    }

    pub async fn pin(&self, key: &ConversationKey) -> Result<bool, EngineError> {
        self.set_top(key, true).await
    }

    pub async fn unpin(&self, key: &ConversationKey) -> Result<bool, EngineError> {
        self.set_top(key, false).await
    }

    async fn set_top(&self, key: &ConversationKey, is_top: bool) -> Result<bool, EngineError> {
        self.ensure_conversations_loaded().await;
        let cached = {
            let mut guard = self.inner.lock().await;
            if is_top {
                guard.conversations.pin(key).is_some()
            } else {
                guard.conversations.unpin(key).is_some()
            }
        };
        let stored = self
            .store
            .set_conversation_to_top(key, is_top)
            .await
            .map_err(EngineError::Store)?;
        Ok(cached || stored)
    }

    /// Drops conversations of the given types, or of every type when `None`.
    pub async fn clear_conversations(
        &self,
        types: Option<&[ConversationType]>,
    ) -> Result<(), EngineError> {
        let types = types.unwrap_or(&ConversationType::ALL);
        self.store
            .clear_conversations(types)
            .await
            .map_err(EngineError::Store)?;
        self.inner.lock().await.conversations.clear_types(types);
        Ok(())
    }

    /// Pulls the server's conversation list and merges it into the cache.
    /// Any failure yields an empty list.
    pub async fn fetch_remote_conversations(
        self: &Arc<Self>,
        filter: Option<&[ConversationType]>,
    ) -> Vec<Conversation> {
        let Some(user_id) = self.current_user_id().await else {
            warn!("conversations: remote list requested without a session");
            return Vec::new();
        };
        let request = RelationsRequest {
            relation_type: CONVERSATION_RELATIONS,
        };
        let response = match self
            .bridge
            .request(
                Operation::GetConversationList,
                encode_payload(&request),
                &user_id,
            )
            .await
            .and_then(|bytes| {
                decode_reply::<RelationsResponse>(Operation::GetConversationList, &bytes)
            }) {
            Ok(response) => response,
            Err(err) => {
                warn!("conversations: remote list failed, reporting none: {err}");
                return Vec::new();
            }
        };

        self.ensure_conversations_loaded().await;
        let incoming = {
            let registry = self.registry.read().await;
            response
                .info
                .iter()
                .map(|item| {
                    let key = ConversationKey::new(item.conversation_type, item.target_id.clone());
                    (key, registry.message_from_wire(&item.latest_message))
                })
                .collect::<Vec<_>>()
        };

        let mut merged = Vec::with_capacity(incoming.len());
        {
            let mut guard = self.inner.lock().await;
            for (key, latest) in incoming {
                guard.conversations.merge_snapshot(&key, latest);
                if let Some(conversation) = guard.conversations.get(&key) {
                    merged.push(conversation.clone());
                }
            }
        }
        info!(count = merged.len(), "conversations: merged remote list");

        for conversation in &merged {
            self.persist_conversation(conversation).await;
            if matches!(
                conversation.key.conversation_type,
                ConversationType::Private | ConversationType::Discussion
            ) {
                self.spawn_metadata_population(conversation.key.clone());
            }
        }

        self.inner.lock().await.conversations.list(filter)
    }

    fn spawn_metadata_population(self: &Arc<Self>, key: ConversationKey) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.populate_metadata(&key).await {
                warn!(%key, "conversations: metadata lookup failed: {err}");
            }
        });
    }

    async fn populate_metadata(&self, key: &ConversationKey) -> Result<(), RemoteError> {
        let updated = match key.conversation_type {
            ConversationType::Private => {
                let bytes = self
                    .bridge
                    .request(
                        Operation::GetUserInfo,
                        encode_payload(&Value::Null),
                        &key.target_id,
                    )
                    .await?;
                let user: UserInfo = decode_reply(Operation::GetUserInfo, &bytes)?;
                let mut guard = self.inner.lock().await;
                let updated = guard.conversations.get_mut(key).map(|conversation| {
                    conversation.title = user.name.clone();
                    conversation.sender_user_id = Some(user.user_id);
                    conversation.sender_user_name = Some(user.name);
                    conversation.sender_portrait_uri = user.portrait_uri;
                    conversation.clone()
                });
                updated
            }
            ConversationType::Discussion => {
                let bytes = self
                    .bridge
                    .request(
                        Operation::GetDiscussion,
                        encode_payload(&Value::Null),
                        &key.target_id,
                    )
                    .await?;
                let discussion: Discussion = decode_reply(Operation::GetDiscussion, &bytes)?;
                let mut guard = self.inner.lock().await;
                let updated = guard.conversations.get_mut(key).map(|conversation| {
                    conversation.title = discussion.name;
                    conversation.clone()
                });
                updated
            }
            _ => None,
        };
        if let Some(conversation) = updated {
            self.persist_conversation(&conversation).await;
        }
        Ok(())
    }

    // Unread counters

    pub async fn get_total_unread_count(&self) -> Result<u32, EngineError> {
        self.store
            .get_total_unread_count()
            .await
            .map_err(EngineError::Store)
    }

    pub async fn get_conversation_unread_count(
        &self,
        types: &[ConversationType],
    ) -> Result<u32, EngineError> {
        self.store
            .get_conversation_unread_count(types)
            .await
            .map_err(EngineError::Store)
    }

    pub async fn get_unread_count(&self, key: &ConversationKey) -> Result<u32, EngineError> {
        self.store
            .get_unread_count(key)
            .await
            .map_err(EngineError::Store)
    }

    pub async fn clear_unread_count(&self, key: &ConversationKey) -> Result<bool, EngineError> {
        if let Some(conversation) = self.inner.lock().await.conversations.get_mut(key) {
            conversation.unread_message_count = 0;
        }
        self.store
            .set_unread_count(key, 0)
            .await
            .map_err(EngineError::Store)
    }

    // Message store passthroughs

    pub async fn clear_messages(&self, key: &ConversationKey) -> Result<(), EngineError> {
        self.store
            .clear_messages(key)
            .await
            .map_err(EngineError::Store)
    }

    pub async fn delete_messages(
        &self,
        key: &ConversationKey,
        ids: &[LocalMessageId],
    ) -> Result<(), EngineError> {
        self.store
            .remove_messages(key, ids)
            .await
            .map_err(EngineError::Store)
    }

    pub async fn set_message_sent_status(
        &self,
        id: LocalMessageId,
        status: SentStatus,
    ) -> Result<bool, EngineError> {
        self.store
            .set_message_sent_status(id, status)
            .await
            .map_err(EngineError::Store)
    }

    pub async fn set_message_received_status(
        &self,
        id: LocalMessageId,
        status: ReceivedStatus,
    ) -> Result<bool, EngineError> {
        self.store
            .set_message_received_status(id, status)
            .await
            .map_err(EngineError::Store)
    }

    pub async fn set_message_extra(
        &self,
        id: LocalMessageId,
        extra: &str,
    ) -> Result<bool, EngineError> {
        self.store
            .set_message_extra(id, extra)
            .await
            .map_err(EngineError::Store)
    }

    /// Asks the HTTP API whether the server holds messages this client has
    /// not pulled yet.
    pub async fn has_remote_unread_messages(&self, token: &str) -> Result<bool, EngineError> {
        let probe_failed = |message: String| {
            EngineError::RemoteRejected(RemoteError::new(ErrorCode::Unknown, message))
        };
        let url = url::Url::parse_with_params(
            &format!("{}/message/exist.json", self.api_base_url),
            &[("appKey", self.app_key.as_str()), ("token", token)],
        )
        .map_err(|err| probe_failed(format!("invalid api base url: {err}")))?;
        let body: Value = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| probe_failed(err.to_string()))?
            .json()
            .await
            .map_err(|err| probe_failed(err.to_string()))?;
        Ok(unread_status(&body))
    }
}

fn unread_status(body: &Value) -> bool {
    match body.get("status").unwrap_or(body) {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_i64().is_some_and(|n| n != 0),
        Value::String(text) => text.trim().parse::<i64>().is_ok_and(|n| n != 0),
        _ => false,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
