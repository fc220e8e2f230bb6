use std::collections::{HashMap, VecDeque};

use shared::domain::ConversationKey;

pub const DEFAULT_WATERMARK_CAPACITY: usize = 1000;

/// Per-conversation sync cursors, bounded to `capacity` keys.
///
/// A cursor only moves forward. When a new key would exceed the capacity
/// the key inserted first is forgotten; its next backfill starts from the
/// newest page again.
#[derive(Debug)]
pub struct WatermarkTracker {
    capacity: usize,
    marks: HashMap<ConversationKey, i64>,
    insertion_order: VecDeque<ConversationKey>,
}

impl Default for WatermarkTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WATERMARK_CAPACITY)
    }
}

impl WatermarkTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            marks: HashMap::new(),
            insertion_order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &ConversationKey) -> Option<i64> {
        self.marks.get(key).copied()
    }

    /// Records `mark` for `key` and returns the value now held.
    pub fn advance(&mut self, key: &ConversationKey, mark: i64) -> i64 {
        if let Some(current) = self.marks.get_mut(key) {
            *current = (*current).max(mark);
            return *current;
        }
        while self.marks.len() >= self.capacity {
            let Some(oldest) = self.insertion_order.pop_front() else {
                break;
            };
            self.marks.remove(&oldest);
        }
        self.marks.insert(key.clone(), mark);
        self.insertion_order.push_back(key.clone());
        mark
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::ConversationType;

    use super::*;

    fn key(target: &str) -> ConversationKey {
        ConversationKey::new(ConversationType::Group, target)
    }

    #[test]
    fn never_moves_backwards() {
        let mut marks = WatermarkTracker::default();
        assert_eq!(marks.advance(&key("g"), 500), 500);
        assert_eq!(marks.advance(&key("g"), 300), 500);
        assert_eq!(marks.advance(&key("g"), 800), 800);
        assert_eq!(marks.get(&key("g")), Some(800));
    }

    #[test]
    fn evicts_oldest_key_at_capacity() {
        let mut marks = WatermarkTracker::new(2);
        marks.advance(&key("a"), 1);
        marks.advance(&key("b"), 2);
        marks.advance(&key("a"), 5);
        marks.advance(&key("c"), 3);

        assert_eq!(marks.len(), 2);
        assert_eq!(marks.get(&key("a")), None);
        assert_eq!(marks.get(&key("b")), Some(2));
        assert_eq!(marks.get(&key("c")), Some(3));
    }
}
