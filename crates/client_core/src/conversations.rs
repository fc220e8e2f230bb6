use std::cmp::Ordering;

use shared::domain::{Conversation, ConversationKey, ConversationType, Message};

/// In-memory conversation list, at most one entry per [`ConversationKey`].
#[derive(Debug, Default)]
pub struct ConversationCache {
    entries: Vec<Conversation>,
}

impl ConversationCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.entries.iter().find(|c| c.key == *key)
    }

    pub fn get_mut(&mut self, key: &ConversationKey) -> Option<&mut Conversation> {
        self.entries.iter_mut().find(|c| c.key == *key)
    }

    fn position(&self, key: &ConversationKey) -> Option<usize> {
        self.entries.iter().position(|c| c.key == *key)
    }

    /// Replaces the entry for the same key in place, or appends.
    pub fn upsert(&mut self, conversation: Conversation) {
        match self.position(&conversation.key) {
            Some(index) => self.entries[index] = conversation,
            None => self.entries.push(conversation),
        }
    }

    /// Adds `conversation` only when its key is not cached yet.
    pub fn insert_if_absent(&mut self, conversation: Conversation) -> bool {
        if self.position(&conversation.key).is_some() {
            return false;
        }
        self.entries.push(conversation);
        true
    }

    /// Returns the entry for `key`, creating an empty one if needed.
    pub fn get_or_create(&mut self, key: &ConversationKey) -> (&mut Conversation, bool) {
        match self.position(key) {
            Some(index) => (&mut self.entries[index], false),
            None => {
                self.entries.push(Conversation::new(key.clone(), ""));
                let last = self.entries.len() - 1;
                (&mut self.entries[last], true)
            }
        }
    }

    pub fn remove(&mut self, key: &ConversationKey) -> Option<Conversation> {
        self.position(key).map(|index| self.entries.remove(index))
    }

    /// Marks the entry pinned and moves it to the front.
    pub fn pin(&mut self, key: &ConversationKey) -> Option<&Conversation> {
        let index = self.position(key)?;
        let mut conversation = self.entries.remove(index);
        conversation.is_top = true;
        self.entries.insert(0, conversation);
        self.entries.first()
    }

    pub fn unpin(&mut self, key: &ConversationKey) -> Option<&Conversation> {
        let conversation = self.get_mut(key)?;
        conversation.is_top = false;
        Some(conversation)
    }

    /// Merges a server snapshot. Existing entries keep their unread count
    /// and position; new ones start with no unread messages and are
    /// appended. Returns `true` when the entry was created.
    pub fn merge_snapshot(&mut self, key: &ConversationKey, latest: Message) -> bool {
        let (conversation, created) = self.get_or_create(key);
        if created {
            conversation.unread_message_count = 0;
        }
        conversation.apply_latest_message(latest);
        created
    }

    /// Drops every entry whose type is in `types`.
    pub fn clear_types(&mut self, types: &[ConversationType]) {
        self.entries
            .retain(|c| !types.contains(&c.key.conversation_type));
    }

    /// Without a filter, orders the cache and returns it. With one, returns
    /// the matching entries in the current cached order and leaves the
    /// cache as it is.
    pub fn list(&mut self, filter: Option<&[ConversationType]>) -> Vec<Conversation> {
        let Some(types) = filter else {
            order_conversations(&mut self.entries);
            return self.entries.clone();
        };
        self.entries
            .iter()
            .filter(|c| types.contains(&c.key.conversation_type))
            .cloned()
            .collect()
    }
}

/// Pinned entries first, in their current relative order, then the rest by
/// `sent_time` descending. The sort is stable, so equal times keep their
/// current order.
pub fn order_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| match (a.is_top, b.is_top) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => b.sent_time.cmp(&a.sent_time),
    });
}
