//! Per-thread message history and unread accounting.
//!
//! `merge_incoming` is an id-based set union followed by a full re-sort, so
//! the three producers that race on the same key (poll, stream, post-send
//! refetch) can interleave in any order with the same final result.

use std::collections::{HashMap, HashSet};

use crate::keys::CanonicalKey;
use crate::network::{Message, WireMessage};

#[derive(Debug, Default)]
pub(crate) struct MessageStore {
    messages: HashMap<CanonicalKey, Vec<Message>>,
    seen_ids: HashMap<CanonicalKey, HashSet<String>>,
}

impl MessageStore {
    /// Merge a batch for `key`; commutative and idempotent. Malformed wire
    /// messages are dropped during normalization. Returns how many messages
    /// were newly added.
    pub fn merge_incoming(&mut self, key: &CanonicalKey, incoming: Vec<WireMessage>) -> usize {
        let mut added = 0;
        for wire in incoming {
            let Some(message) = Message::from_wire(wire) else {
                continue;
            };
            let seen = self.seen_ids.entry(key.clone()).or_default();
            if !seen.insert(message.id.clone()) {
                continue;
            }
            self.messages.entry(key.clone()).or_default().push(message);
            added += 1;
        }
        if added > 0 {
            if let Some(list) = self.messages.get_mut(key) {
                // Tie-break equal timestamps by id so output is deterministic.
                list.sort_by(|a, b| {
                    a.sent_at_ns
                        .cmp(&b.sent_at_ns)
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
        }
        added
    }

    /// Current ordered, deduplicated history for `key` (possibly empty).
    pub fn messages(&self, key: &CanonicalKey) -> &[Message] {
        self.messages.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_sent_at_ns(&self, key: &CanonicalKey) -> Option<i64> {
        self.messages
            .get(key)
            .and_then(|list| list.last())
            .map(|m| m.sent_at_ns)
    }
}

/// Unread counts per canonical key, fed by merge results.
#[derive(Debug, Default)]
pub(crate) struct UnreadTracker {
    counts: HashMap<CanonicalKey, u32>,
}

impl UnreadTracker {
    /// Account for a merge that added `added` new messages while `selected`
    /// was the active thread. Messages for the active thread are read
    /// immediately and never counted.
    pub fn record_merge(
        &mut self,
        key: &CanonicalKey,
        added: usize,
        selected: Option<&CanonicalKey>,
    ) {
        if added == 0 || selected == Some(key) {
            return;
        }
        *self.counts.entry(key.clone()).or_insert(0) += added as u32;
    }

    pub fn reset(&mut self, key: &CanonicalKey) {
        self.counts.insert(key.clone(), 0);
    }

    pub fn count(&self, key: &CanonicalKey) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }
}
