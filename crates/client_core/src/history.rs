use shared::{
    domain::ConversationKey,
    protocol::{HistoryRequest, HistoryResponse, Operation},
};
use tracing::{error, info, warn};

use crate::{
    store::HistoryPage,
    transport::{decode_reply, encode_payload},
    EngineError, ImClient,
};

/// Largest page either history call accepts.
pub const MAX_HISTORY_PAGE: u32 = 20;

fn check_page_size(count: u32) -> Result<(), EngineError> {
    if count > MAX_HISTORY_PAGE {
        return Err(EngineError::precondition(format!(
            "history page of {count} exceeds the limit of {MAX_HISTORY_PAGE}"
        )));
    }
    Ok(())
}

impl ImClient {
    /// Reads a page from the local store, oldest first, ending before
    /// `before` when given.
    pub async fn fetch_local_history(
        &self,
        key: &ConversationKey,
        before: Option<i64>,
        count: u32,
    ) -> Result<HistoryPage, EngineError> {
        check_page_size(count)?;
        self.store
            .get_history_messages(key, before, count)
            .await
            .map_err(EngineError::Store)
    }

    /// Pulls one page from the server, oldest first.
    ///
    /// Without `before` the page continues from the conversation's
    /// watermark; an explicit cursor bypasses it. Only argument errors are
    /// returned: a failed request yields an empty page with
    /// `has_more == false`, indistinguishable from exhausted history.
    pub async fn fetch_remote_history(
        &self,
        key: &ConversationKey,
        before: Option<i64>,
        count: u32,
    ) -> Result<HistoryPage, EngineError> {
        check_page_size(count)?;
        let op = Operation::history_for(key.conversation_type).ok_or_else(|| {
            EngineError::precondition(format!(
                "{:?} conversations keep no history",
                key.conversation_type
            ))
        })?;

        let cursor = match before.filter(|timestamp| *timestamp > 0) {
            Some(timestamp) => timestamp,
            None => self
                .inner
                .lock()
                .await
                .history_watermarks
                .get(key)
                .unwrap_or(0),
        };
        let request = HistoryRequest {
            target_id: key.target_id.clone(),
            data_time: cursor,
            size: count,
        };
        let response = match self
            .bridge
            .request(op, encode_payload(&request), &key.target_id)
            .await
            .and_then(|bytes| decode_reply::<HistoryResponse>(op, &bytes))
        {
            Ok(response) => response,
            Err(err) => {
                warn!(%key, cursor, "history: remote page failed, reporting exhaustion: {err}");
                return Ok(HistoryPage::exhausted());
            }
        };

        let watermark = self
            .inner
            .lock()
            .await
            .history_watermarks
            .advance(key, response.sync_time);

        let mut messages = {
            let registry = self.registry.read().await;
            response
                .list
                .iter()
                .map(|wire| registry.message_from_wire(wire))
                .collect::<Vec<_>>()
        };
        messages.truncate(count as usize);
        messages.reverse();

        let mut merged = Vec::with_capacity(messages.len());
        for message in messages {
            match self.store.add_message(message.clone()).await {
                Ok(stored) => merged.push(stored),
                Err(err) => {
                    error!(%key, "history: failed to merge message into store: {err:#}");
                    merged.push(message);
                }
            }
        }
        info!(
            %key,
            cursor,
            watermark,
            count = merged.len(),
            has_more = response.has_msg,
            "history: remote page merged"
        );
        Ok(HistoryPage {
            messages: merged,
            has_more: response.has_msg,
        })
    }

    pub async fn history_watermark(&self, key: &ConversationKey) -> Option<i64> {
        self.inner.lock().await.history_watermarks.get(key)
    }
}
