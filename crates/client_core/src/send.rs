use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{
    content::MessageContent,
    domain::{ConversationKey, ConversationType, Message, MessageDirection, ReceivedStatus, SentStatus},
    error::ErrorCode,
    protocol::{Operation, PublishAck, PublishRequest},
};
use tracing::{error, info, warn};

use crate::{
    now_millis,
    transport::{decode_reply, encode_payload, ChannelState},
    EngineError, ImClient, SendError,
};

impl ImClient {
    /// Sends one message: persists it as `Sending`, surfaces its
    /// conversation, issues exactly one publish request and settles the
    /// message as `Sent` or `Failed`.
    ///
    /// Fails without touching the store when no channel exists
    /// (`NetUnavailable`) or the channel is not connected (`Timeout`).
    pub async fn send_message(
        &self,
        conversation_type: ConversationType,
        target_id: impl Into<String>,
        content: MessageContent,
    ) -> Result<Message, SendError> {
        let key = ConversationKey::new(conversation_type, target_id);
        match self.bridge.channel_state().await {
            ChannelState::Connected => {}
            ChannelState::Absent => {
                warn!(%key, "send: no channel");
                return Err(SendError::rejected(EngineError::TransportUnavailable(
                    ErrorCode::NetUnavailable,
                )));
            }
            ChannelState::Connecting | ChannelState::Disconnected => {
                warn!(%key, "send: channel not connected");
                return Err(SendError::rejected(EngineError::TransportUnavailable(
                    ErrorCode::Timeout,
                )));
            }
        }

        let (descriptor, encoded) = self
            .registry
            .read()
            .await
            .encode(&content)
            .map_err(|err| SendError::rejected(err.into()))?;
        let sender_user_id = self.current_user_id().await.unwrap_or_default();

        let outgoing = Message {
            local_id: None,
            key: key.clone(),
            sender_user_id: sender_user_id.clone(),
            direction: MessageDirection::Send,
            content,
            object_name: descriptor.object_name.clone(),
            sent_status: SentStatus::Sending,
            received_status: ReceivedStatus::Read,
            sent_time: now_millis(),
            received_time: None,
            server_message_id: None,
            extra: None,
        };
        let mut message = self
            .store
            .add_message(outgoing)
            .await
            .map_err(|err| SendError::rejected(EngineError::Store(err)))?;

        let surfaced = {
            let mut guard = self.inner.lock().await;
            let (conversation, created) = guard.conversations.get_or_create(&key);
            conversation.apply_latest_message(message.clone());
            conversation.sender_user_id = Some(sender_user_id);
            conversation.unread_message_count = 0;
            if created {
                info!(%key, "send: created conversation");
            }
            guard.conversations.pin(&key).cloned()
        };
        if let Some(conversation) = &surfaced {
            self.persist_conversation(conversation).await;
        }

        let request = PublishRequest {
            conversation_type,
            session_id: descriptor.tag.session_id(),
            class_name: descriptor.object_name.clone(),
            content_b64: STANDARD.encode(encoded),
        };
        info!(
            %key,
            object_name = %descriptor.object_name,
            local_id = ?message.local_id,
            "send: publishing"
        );
        let outcome = self
            .bridge
            .request(
                Operation::PublishMessage,
                encode_payload(&request),
                &key.target_id,
            )
            .await
            .and_then(|bytes| decode_reply::<PublishAck>(Operation::PublishMessage, &bytes));

        match outcome {
            Ok(ack) => {
                message.server_message_id = Some(ack.message_uid);
                message.sent_time = ack.timestamp;
                message.sent_status = SentStatus::Sent;
                self.settle_send(&message).await;
                info!(%key, server_message_id = ?message.server_message_id, "send: acknowledged");
                Ok(message)
            }
            Err(err) => {
                message.sent_status = SentStatus::Failed;
                self.settle_send(&message).await;
                warn!(%key, "send: failed: {err}");
                Err(SendError {
                    error: EngineError::RemoteRejected(err),
                    message: Some(message),
                })
            }
        }
    }

    pub async fn send_text(
        &self,
        conversation_type: ConversationType,
        target_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Message, SendError> {
        self.send_message(conversation_type, target_id, MessageContent::text(text))
            .await
    }

    /// Writes `message` back to the store, then submits its content as a new
    /// send.
    pub async fn resend(&self, message: Message) -> Result<Message, SendError> {
        if message.local_id.is_some() {
            self.store
                .update_message(&message)
                .await
                .map_err(|err| SendError::rejected(EngineError::Store(err)))?;
        }
        self.send_message(
            message.key.conversation_type,
            message.key.target_id,
            message.content,
        )
        .await
    }

    /// Stores a message without sending it. The direction follows the
    /// sender: the signed-in user yields `Send`, anyone else `Receive`.
    pub async fn insert_local(
        &self,
        key: ConversationKey,
        sender_user_id: &str,
        content: MessageContent,
    ) -> Result<Message, EngineError> {
        let object_name = self
            .registry
            .read()
            .await
            .descriptor(content.message_type())
            .map(|descriptor| descriptor.object_name.clone())
            .ok_or_else(|| {
                EngineError::precondition(format!(
                    "content type {} is not registered",
                    content.message_type()
                ))
            })?;
        let is_own = self.current_user_id().await.as_deref() == Some(sender_user_id);
        let now = now_millis();
        let message = Message {
            local_id: None,
            key,
            sender_user_id: sender_user_id.to_string(),
            direction: if is_own {
                MessageDirection::Send
            } else {
                MessageDirection::Receive
            },
            content,
            object_name,
            sent_status: SentStatus::Sent,
            received_status: ReceivedStatus::Unread,
            sent_time: now,
            received_time: (!is_own).then_some(now),
            server_message_id: None,
            extra: None,
        };
        self.store.add_message(message).await.map_err(EngineError::Store)
    }

    /// Records the settled message and makes it the conversation's latest.
    async fn settle_send(&self, message: &Message) {
        if let Err(err) = self.store.update_message(message).await {
            error!(key = %message.key, "send: failed to persist settled message: {err:#}");
        }
        let conversation = {
            let mut guard = self.inner.lock().await;
            let conversation = guard.conversations.get_mut(&message.key).map(|conversation| {
                conversation.apply_latest_message(message.clone());
                conversation.clone()
            });
            conversation
        };
        if let Some(conversation) = conversation {
            self.persist_conversation(&conversation).await;
        }
    }
}
