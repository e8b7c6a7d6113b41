//! Receiver-side message list.
//!
//! Both senders keep their own `seq` counter, so the log dedups on
//! `(seq, type)` and orders entries by sender timestamp when merging the two
//! streams.

use std::collections::HashSet;

use crate::messages::{DedupKey, RealtimeMessage};

/// Deduplicated, timestamp-ordered list of received messages.
#[derive(Clone, Debug, Default)]
pub struct MessageLog {
    entries: Vec<RealtimeMessage>,
    seen: HashSet<DedupKey>,
}

impl MessageLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message. Returns `false` if its `(seq, type)` was already
    /// seen.
    ///
    /// Messages with equal timestamps keep arrival order.
    pub fn insert(&mut self, message: RealtimeMessage) -> bool {
        if !self.seen.insert(message.dedup_key()) {
            return false;
        }
        let at = self
            .entries
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.entries.insert(at, message);
        true
    }

    /// Insert many messages, returning how many were new.
    pub fn extend<I: IntoIterator<Item = RealtimeMessage>>(&mut self, messages: I) -> usize {
        let mut added = 0;
        for message in messages {
            if self.insert(message) {
                added += 1;
            }
        }
        added
    }

    /// Whether a key has been seen.
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    /// Entries in display order.
    pub fn entries(&self) -> &[RealtimeMessage] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries and forget seen keys.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageBody, MessageType};

    fn msg(body: MessageBody, seq: u64, timestamp: i64) -> RealtimeMessage {
        RealtimeMessage { body, timestamp, seq }
    }

    #[test]
    fn replay_does_not_duplicate() {
        let mut log = MessageLog::new();
        assert!(log.insert(msg(MessageBody::output("a"), 1, 10)));
        assert!(!log.insert(msg(MessageBody::output("a"), 1, 10)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn same_seq_different_type_is_distinct() {
        let mut log = MessageLog::new();
        assert!(log.insert(msg(MessageBody::input("q"), 1, 10)));
        assert!(log.insert(msg(MessageBody::output("a"), 1, 11)));
        assert_eq!(log.len(), 2);
        assert!(log.contains(&(1, MessageType::Input)));
        assert!(log.contains(&(1, MessageType::Output)));
    }

    #[test]
    fn merges_by_timestamp_not_seq() {
        let mut log = MessageLog::new();
        log.insert(msg(MessageBody::output("late"), 1, 30));
        log.insert(msg(MessageBody::input("early"), 7, 10));
        log.insert(msg(MessageBody::output("mid"), 2, 20));
        let contents: Vec<_> = log.entries().iter().filter_map(RealtimeMessage::content).collect();
        assert_eq!(contents, ["early", "mid", "late"]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut log = MessageLog::new();
        log.insert(msg(MessageBody::output("first"), 1, 5));
        log.insert(msg(MessageBody::output("second"), 2, 5));
        assert_eq!(log.entries()[0].content(), Some("first"));
        assert_eq!(log.entries()[1].content(), Some("second"));
    }

    #[test]
    fn extend_counts_new_entries() {
        let mut log = MessageLog::new();
        let batch = vec![
            msg(MessageBody::output("a"), 1, 1),
            msg(MessageBody::output("a"), 1, 1),
            msg(MessageBody::output("b"), 2, 2),
        ];
        assert_eq!(log.extend(batch), 2);
        log.clear();
        assert!(log.is_empty());
        assert!(!log.contains(&(1, MessageType::Output)));
    }
}
