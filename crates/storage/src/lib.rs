use anyhow::{anyhow, Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    content::MessageContent,
    domain::{
        Conversation, ConversationKey, ConversationType, LocalMessageId, Message,
        MessageDirection, NotificationStatus, ReceivedStatus, SentStatus,
    },
};

const MESSAGE_COLUMNS: &str = "local_id, conversation_type, target_id, sender_user_id, direction, object_name, content_json, sent_status, received_status, sent_time, received_time, server_message_id, extra";

const CONVERSATION_COLUMNS: &str = "conversation_type, target_id, title, latest_message_json, unread_count, is_top, sent_time, sent_status, notification_status, sender_user_id, sender_user_name, sender_portrait_uri";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// One page of locally stored history, oldest first.
#[derive(Debug, Clone)]
pub struct StoredHistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts a message and returns it with its assigned local id.
    ///
    /// A message carrying a server id that is already stored is not inserted
    /// twice; the stored record is returned instead.
    pub async fn insert_message(&self, message: &Message) -> Result<Message> {
        if let Some(server_message_id) = &message.server_message_id {
            if let Some(existing) = self.load_message_by_server_id(server_message_id).await? {
                return Ok(existing);
            }
        }

        let content_json = serde_json::to_string(&message.content)
            .context("failed to serialize message content")?;
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_type, target_id, sender_user_id, direction, object_name, content_json, sent_status, received_status, sent_time, received_time, server_message_id, extra)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING local_id",
        )
        .bind(message.key.conversation_type.as_i64())
        .bind(&message.key.target_id)
        .bind(&message.sender_user_id)
        .bind(message.direction.as_i64())
        .bind(&message.object_name)
        .bind(content_json)
        .bind(message.sent_status.as_i64())
        .bind(message.received_status.as_i64())
        .bind(message.sent_time)
        .bind(message.received_time)
        .bind(&message.server_message_id)
        .bind(&message.extra)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;

        let mut stored = message.clone();
        stored.local_id = Some(LocalMessageId(rec.get::<i64, _>(0)));
        Ok(stored)
    }

    pub async fn update_message(&self, message: &Message) -> Result<()> {
        let local_id = message
            .local_id
            .ok_or_else(|| anyhow!("cannot update a message that was never stored"))?;
        let content_json = serde_json::to_string(&message.content)
            .context("failed to serialize message content")?;
        sqlx::query(
            "UPDATE messages
             SET object_name = ?, content_json = ?, sent_status = ?, received_status = ?,
                 sent_time = ?, received_time = ?, server_message_id = ?, extra = ?
             WHERE local_id = ?",
        )
        .bind(&message.object_name)
        .bind(content_json)
        .bind(message.sent_status.as_i64())
        .bind(message.received_status.as_i64())
        .bind(message.sent_time)
        .bind(message.received_time)
        .bind(&message.server_message_id)
        .bind(&message.extra)
        .bind(local_id.0)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update message {}", local_id.0))?;
        Ok(())
    }

    pub async fn load_message(&self, local_id: LocalMessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE local_id = ?"
        ))
        .bind(local_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn load_message_by_server_id(&self, server_message_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE server_message_id = ?"
        ))
        .bind(server_message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn delete_messages(
        &self,
        key: &ConversationKey,
        local_ids: &[LocalMessageId],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for local_id in local_ids {
            removed += sqlx::query(
                "DELETE FROM messages WHERE local_id = ? AND conversation_type = ? AND target_id = ?",
            )
            .bind(local_id.0)
            .bind(key.conversation_type.as_i64())
            .bind(&key.target_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn clear_messages(&self, key: &ConversationKey) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM messages WHERE conversation_type = ? AND target_id = ?")
            .bind(key.conversation_type.as_i64())
            .bind(&key.target_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    /// Messages strictly older than `before` (or the newest ones when absent),
    /// returned oldest first.
    pub async fn list_history(
        &self,
        key: &ConversationKey,
        before: Option<i64>,
        limit: u32,
    ) -> Result<StoredHistoryPage> {
        let probe = i64::from(limit) + 1;
        let mut rows = if let Some(before) = before {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_type = ? AND target_id = ? AND sent_time < ?
                 ORDER BY sent_time DESC, local_id DESC
                 LIMIT ?"
            ))
            .bind(key.conversation_type.as_i64())
            .bind(&key.target_id)
            .bind(before)
            .bind(probe)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_type = ? AND target_id = ?
                 ORDER BY sent_time DESC, local_id DESC
                 LIMIT ?"
            ))
            .bind(key.conversation_type.as_i64())
            .bind(&key.target_id)
            .bind(probe)
            .fetch_all(&self.pool)
            .await?
        };

        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);
        rows.reverse();
        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(StoredHistoryPage { messages, has_more })
    }

    pub async fn set_message_sent_status(
        &self,
        local_id: LocalMessageId,
        status: SentStatus,
    ) -> Result<bool> {
        let affected = sqlx::query("UPDATE messages SET sent_status = ? WHERE local_id = ?")
            .bind(status.as_i64())
            .bind(local_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn set_message_received_status(
        &self,
        local_id: LocalMessageId,
        status: ReceivedStatus,
    ) -> Result<bool> {
        let affected = sqlx::query("UPDATE messages SET received_status = ? WHERE local_id = ?")
            .bind(status.as_i64())
            .bind(local_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn set_message_extra(&self, local_id: LocalMessageId, extra: &str) -> Result<bool> {
        let affected = sqlx::query("UPDATE messages SET extra = ? WHERE local_id = ?")
            .bind(extra)
            .bind(local_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let latest_message_json = conversation
            .latest_message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize latest message")?;
        sqlx::query(
            "INSERT INTO conversations (conversation_type, target_id, title, latest_message_json, unread_count, is_top, sent_time, sent_status, notification_status, sender_user_id, sender_user_name, sender_portrait_uri)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(conversation_type, target_id) DO UPDATE SET
                title = excluded.title,
                latest_message_json = excluded.latest_message_json,
                unread_count = excluded.unread_count,
                is_top = excluded.is_top,
                sent_time = excluded.sent_time,
                sent_status = excluded.sent_status,
                notification_status = excluded.notification_status,
                sender_user_id = excluded.sender_user_id,
                sender_user_name = excluded.sender_user_name,
                sender_portrait_uri = excluded.sender_portrait_uri",
        )
        .bind(conversation.key.conversation_type.as_i64())
        .bind(&conversation.key.target_id)
        .bind(&conversation.title)
        .bind(latest_message_json)
        .bind(i64::from(conversation.unread_message_count))
        .bind(conversation.is_top)
        .bind(conversation.sent_time)
        .bind(conversation.sent_status.map(SentStatus::as_i64))
        .bind(conversation.notification_status.as_i64())
        .bind(&conversation.sender_user_id)
        .bind(&conversation.sender_user_name)
        .bind(&conversation.sender_portrait_uri)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert conversation {}", conversation.key))?;
        Ok(())
    }

    pub async fn load_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE conversation_type = ? AND target_id = ?"
        ))
        .bind(key.conversation_type.as_i64())
        .bind(&key.target_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Pinned conversations first, then most recent first. Equal times come
    /// back in insertion order.
    pub async fn list_conversations(
        &self,
        types: Option<&[ConversationType]>,
    ) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY is_top DESC, sent_time DESC, rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        let conversations = rows
            .iter()
            .map(conversation_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(match types {
            Some(types) => conversations
                .into_iter()
                .filter(|c| types.contains(&c.key.conversation_type))
                .collect(),
            None => conversations,
        })
    }

    pub async fn delete_conversation(&self, key: &ConversationKey) -> Result<bool> {
        let affected =
            sqlx::query("DELETE FROM conversations WHERE conversation_type = ? AND target_id = ?")
                .bind(key.conversation_type.as_i64())
                .bind(&key.target_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected > 0)
    }

    pub async fn clear_conversations(&self, types: &[ConversationType]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for conversation_type in types {
            removed += sqlx::query("DELETE FROM conversations WHERE conversation_type = ?")
                .bind(conversation_type.as_i64())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn set_conversation_top(&self, key: &ConversationKey, is_top: bool) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE conversations SET is_top = ? WHERE conversation_type = ? AND target_id = ?",
        )
        .bind(is_top)
        .bind(key.conversation_type.as_i64())
        .bind(&key.target_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn unread_count(&self, key: &ConversationKey) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT unread_count FROM conversations WHERE conversation_type = ? AND target_id = ?",
        )
        .bind(key.conversation_type.as_i64())
        .bind(&key.target_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }

    pub async fn total_unread_count(&self) -> Result<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(unread_count), 0) FROM conversations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u32)
    }

    pub async fn unread_count_for_types(&self, types: &[ConversationType]) -> Result<u32> {
        let mut total: i64 = 0;
        for conversation_type in types {
            let count: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(unread_count), 0) FROM conversations WHERE conversation_type = ?",
            )
            .bind(conversation_type.as_i64())
            .fetch_one(&self.pool)
            .await?;
            total += count;
        }
        Ok(total.max(0) as u32)
    }

    pub async fn set_unread_count(&self, key: &ConversationKey, count: u32) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE conversations SET unread_count = ? WHERE conversation_type = ? AND target_id = ?",
        )
        .bind(i64::from(count))
        .bind(key.conversation_type.as_i64())
        .bind(&key.target_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }
}

fn conversation_type_column(row: &SqliteRow, column: &str) -> Result<ConversationType> {
    let raw: i64 = row.try_get(column)?;
    ConversationType::from_i64(raw).ok_or_else(|| anyhow!("unknown conversation type {raw}"))
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let content_json: String = row.try_get("content_json")?;
    let content: MessageContent =
        serde_json::from_str(&content_json).context("failed to decode stored message content")?;
    let direction: i64 = row.try_get("direction")?;
    let sent_status: i64 = row.try_get("sent_status")?;
    let received_status: i64 = row.try_get("received_status")?;

    Ok(Message {
        local_id: Some(LocalMessageId(row.try_get("local_id")?)),
        key: ConversationKey::new(
            conversation_type_column(row, "conversation_type")?,
            row.try_get::<String, _>("target_id")?,
        ),
        sender_user_id: row.try_get("sender_user_id")?,
        direction: MessageDirection::from_i64(direction)
            .ok_or_else(|| anyhow!("unknown message direction {direction}"))?,
        content,
        object_name: row.try_get("object_name")?,
        sent_status: SentStatus::from_i64(sent_status)
            .ok_or_else(|| anyhow!("unknown sent status {sent_status}"))?,
        received_status: ReceivedStatus::from_i64(received_status).unwrap_or_default(),
        sent_time: row.try_get("sent_time")?,
        received_time: row.try_get("received_time")?,
        server_message_id: row.try_get("server_message_id")?,
        extra: row.try_get("extra")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let latest_message_json: Option<String> = row.try_get("latest_message_json")?;
    let latest_message = latest_message_json
        .map(|raw| serde_json::from_str::<Message>(&raw))
        .transpose()
        .context("failed to decode stored latest message")?;
    let unread_count: i64 = row.try_get("unread_count")?;
    let is_top: i64 = row.try_get("is_top")?;
    let sent_status: Option<i64> = row.try_get("sent_status")?;
    let notification_status: i64 = row.try_get("notification_status")?;

    Ok(Conversation {
        key: ConversationKey::new(
            conversation_type_column(row, "conversation_type")?,
            row.try_get::<String, _>("target_id")?,
        ),
        title: row.try_get("title")?,
        latest_message,
        unread_message_count: unread_count.max(0) as u32,
        is_top: is_top != 0,
        sent_time: row.try_get("sent_time")?,
        sent_status: sent_status.and_then(SentStatus::from_i64),
        notification_status: NotificationStatus::from_i64(notification_status).unwrap_or_default(),
        sender_user_id: row.try_get("sender_user_id")?,
        sender_user_name: row.try_get("sender_user_name")?,
        sender_portrait_uri: row.try_get("sender_portrait_uri")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
