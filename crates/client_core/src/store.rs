use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{
    Conversation, ConversationKey, ConversationType, LocalMessageId, Message, ReceivedStatus,
    SentStatus,
};
use tokio::sync::Mutex;

use crate::conversations::order_conversations;

/// One page of history, oldest message first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

impl HistoryPage {
    pub fn exhausted() -> Self {
        Self::default()
    }
}

/// Persistence for messages and conversations.
///
/// `add_message` assigns the local id and is idempotent on the server
/// message id, so backfilled pages can be merged repeatedly.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn add_message(&self, message: Message) -> Result<Message>;
    async fn update_message(&self, message: &Message) -> Result<()>;
    async fn remove_messages(&self, key: &ConversationKey, ids: &[LocalMessageId]) -> Result<()>;
    async fn clear_messages(&self, key: &ConversationKey) -> Result<()>;
    async fn get_history_messages(
        &self,
        key: &ConversationKey,
        before: Option<i64>,
        count: u32,
    ) -> Result<HistoryPage>;
    async fn set_message_sent_status(&self, id: LocalMessageId, status: SentStatus)
        -> Result<bool>;
    async fn set_message_received_status(
        &self,
        id: LocalMessageId,
        status: ReceivedStatus,
    ) -> Result<bool>;
    async fn set_message_extra(&self, id: LocalMessageId, extra: &str) -> Result<bool>;

    async fn add_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn get_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>>;
    async fn get_conversation_list(
        &self,
        types: Option<&[ConversationType]>,
    ) -> Result<Vec<Conversation>>;
    async fn remove_conversation(&self, key: &ConversationKey) -> Result<bool>;
    async fn clear_conversations(&self, types: &[ConversationType]) -> Result<()>;
    async fn set_conversation_to_top(&self, key: &ConversationKey, is_top: bool) -> Result<bool>;

    async fn get_unread_count(&self, key: &ConversationKey) -> Result<u32>;
    async fn get_total_unread_count(&self) -> Result<u32>;
    async fn get_conversation_unread_count(&self, types: &[ConversationType]) -> Result<u32>;
    async fn set_unread_count(&self, key: &ConversationKey, count: u32) -> Result<bool>;
}

#[derive(Default)]
struct MemoryState {
    next_local_id: i64,
    messages: BTreeMap<i64, Message>,
    conversations: Vec<Conversation>,
}

/// Process-local [`LocalStore`]; the default when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn message_mut(state: &mut MemoryState, id: LocalMessageId) -> Option<&mut Message> {
    state.messages.get_mut(&id.0)
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn add_message(&self, mut message: Message) -> Result<Message> {
        let mut state = self.state.lock().await;
        if let Some(server_id) = message.server_message_id.as_deref() {
            if let Some(existing) = state
                .messages
                .values()
                .find(|m| m.server_message_id.as_deref() == Some(server_id))
            {
                return Ok(existing.clone());
            }
        }
        state.next_local_id += 1;
        let id = state.next_local_id;
        message.local_id = Some(LocalMessageId(id));
        state.messages.insert(id, message.clone());
        Ok(message)
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        let Some(id) = message.local_id else {
            anyhow::bail!("message has no local id");
        };
        let mut state = self.state.lock().await;
        match message_mut(&mut state, id) {
            Some(slot) => {
                *slot = message.clone();
                Ok(())
            }
            None => anyhow::bail!("message {} not found", id.0),
        }
    }

    async fn remove_messages(&self, key: &ConversationKey, ids: &[LocalMessageId]) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .messages
            .retain(|id, m| m.key != *key || !ids.contains(&LocalMessageId(*id)));
        Ok(())
    }

    async fn clear_messages(&self, key: &ConversationKey) -> Result<()> {
        let mut state = self.state.lock().await;
        state.messages.retain(|_, m| m.key != *key);
        Ok(())
    }

    async fn get_history_messages(
        &self,
        key: &ConversationKey,
        before: Option<i64>,
        count: u32,
    ) -> Result<HistoryPage> {
        let state = self.state.lock().await;
        let mut matching: Vec<&Message> = state
            .messages
            .values()
            .filter(|m| m.key == *key && before.map_or(true, |t| m.sent_time < t))
            .collect();
        matching.sort_by_key(|m| (m.sent_time, m.local_id.map(|id| id.0)));
        let limit = count as usize;
        let has_more = matching.len() > limit;
        let start = matching.len().saturating_sub(limit);
        Ok(HistoryPage {
            messages: matching[start..].iter().map(|m| (*m).clone()).collect(),
            has_more,
        })
    }

    async fn set_message_sent_status(
        &self,
        id: LocalMessageId,
        status: SentStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(message_mut(&mut state, id)
            .map(|m| m.sent_status = status)
            .is_some())
    }

    async fn set_message_received_status(
        &self,
        id: LocalMessageId,
        status: ReceivedStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(message_mut(&mut state, id)
            .map(|m| m.received_status = status)
            .is_some())
    }

    async fn set_message_extra(&self, id: LocalMessageId, extra: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(message_mut(&mut state, id)
            .map(|m| m.extra = Some(extra.to_string()))
            .is_some())
    }

    async fn add_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut state = self.state.lock().await;
        match state
            .conversations
            .iter_mut()
            .find(|c| c.key == conversation.key)
        {
            Some(slot) => *slot = conversation.clone(),
            None => state.conversations.push(conversation.clone()),
        }
        Ok(())
    }

    async fn get_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let state = self.state.lock().await;
        Ok(state.conversations.iter().find(|c| c.key == *key).cloned())
    }

    async fn get_conversation_list(
        &self,
        types: Option<&[ConversationType]>,
    ) -> Result<Vec<Conversation>> {
        let state = self.state.lock().await;
        let mut list: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| types.map_or(true, |t| t.contains(&c.key.conversation_type)))
            .cloned()
            .collect();
        order_conversations(&mut list);
        Ok(list)
    }

    async fn remove_conversation(&self, key: &ConversationKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.conversations.len();
        state.conversations.retain(|c| c.key != *key);
        Ok(state.conversations.len() != before)
    }

    async fn clear_conversations(&self, types: &[ConversationType]) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .conversations
            .retain(|c| !types.contains(&c.key.conversation_type));
        Ok(())
    }

    async fn set_conversation_to_top(&self, key: &ConversationKey, is_top: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .conversations
            .iter_mut()
            .find(|c| c.key == *key)
            .map(|c| c.is_top = is_top)
            .is_some())
    }

    async fn get_unread_count(&self, key: &ConversationKey) -> Result<u32> {
        let state = self.state.lock().await;
        Ok(state
            .conversations
            .iter()
            .find(|c| c.key == *key)
            .map_or(0, |c| c.unread_message_count))
    }

    async fn get_total_unread_count(&self) -> Result<u32> {
        let state = self.state.lock().await;
        Ok(state
            .conversations
            .iter()
            .map(|c| c.unread_message_count)
            .sum())
    }

    async fn get_conversation_unread_count(&self, types: &[ConversationType]) -> Result<u32> {
        let state = self.state.lock().await;
        Ok(state
            .conversations
            .iter()
            .filter(|c| types.contains(&c.key.conversation_type))
            .map(|c| c.unread_message_count)
            .sum())
    }

    async fn set_unread_count(&self, key: &ConversationKey, count: u32) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .conversations
            .iter_mut()
            .find(|c| c.key == *key)
            .map(|c| c.unread_message_count = count)
            .is_some())
    }
}
