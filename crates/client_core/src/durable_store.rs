use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{
    Conversation, ConversationKey, ConversationType, LocalMessageId, Message, ReceivedStatus,
    SentStatus,
};
use storage::Storage;

use crate::store::{HistoryPage, LocalStore};

/// [`LocalStore`] backed by the SQLite database in the `storage` crate.
pub struct DurableLocalStore {
    store: Storage,
}

impl DurableLocalStore {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize sync storage at '{database_url}'"))?;
        Ok(Arc::new(Self { store }))
    }
}

#[async_trait]
impl LocalStore for DurableLocalStore {
    async fn add_message(&self, message: Message) -> Result<Message> {
        self.store.insert_message(&message).await
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        self.store.update_message(message).await
    }

    async fn remove_messages(&self, key: &ConversationKey, ids: &[LocalMessageId]) -> Result<()> {
        self.store.delete_messages(key, ids).await.map(|_| ())
    }

    async fn clear_messages(&self, key: &ConversationKey) -> Result<()> {
        self.store.clear_messages(key).await.map(|_| ())
    }

    async fn get_history_messages(
        &self,
        key: &ConversationKey,
        before: Option<i64>,
        count: u32,
    ) -> Result<HistoryPage> {
        let page = self.store.list_history(key, before, count).await?;
        Ok(HistoryPage {
            messages: page.messages,
            has_more: page.has_more,
        })
    }

    async fn set_message_sent_status(
        &self,
        id: LocalMessageId,
        status: SentStatus,
    ) -> Result<bool> {
        self.store.set_message_sent_status(id, status).await
    }

    async fn set_message_received_status(
        &self,
        id: LocalMessageId,
        status: ReceivedStatus,
    ) -> Result<bool> {
        self.store.set_message_received_status(id, status).await
    }

    async fn set_message_extra(&self, id: LocalMessageId, extra: &str) -> Result<bool> {
        self.store.set_message_extra(id, extra).await
    }

    async fn add_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.store.upsert_conversation(conversation).await
    }

    async fn get_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        self.store.load_conversation(key).await
    }

    async fn get_conversation_list(
        &self,
        types: Option<&[ConversationType]>,
    ) -> Result<Vec<Conversation>> {
        self.store.list_conversations(types).await
    }

    async fn remove_conversation(&self, key: &ConversationKey) -> Result<bool> {
        self.store.delete_conversation(key).await
    }

    async fn clear_conversations(&self, types: &[ConversationType]) -> Result<()> {
        self.store.clear_conversations(types).await.map(|_| ())
    }

    async fn set_conversation_to_top(&self, key: &ConversationKey, is_top: bool) -> Result<bool> {
        self.store.set_conversation_top(key, is_top).await
    }

    async fn get_unread_count(&self, key: &ConversationKey) -> Result<u32> {
        self.store.unread_count(key).await
    }

    async fn get_total_unread_count(&self) -> Result<u32> {
        self.store.total_unread_count().await
    }

    async fn get_conversation_unread_count(&self, types: &[ConversationType]) -> Result<u32> {
        self.store.unread_count_for_types(types).await
    }

    async fn set_unread_count(&self, key: &ConversationKey, count: u32) -> Result<bool> {
        self.store.set_unread_count(key, count).await
    }
}
