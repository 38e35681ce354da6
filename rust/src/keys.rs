//! Canonical key derivation: collapsing any number of network conversation
//! objects that refer to the same counterparty into one logical thread id.

use std::collections::HashMap;
use std::fmt;

const DIRECT_PREFIX: &str = "dm:";
const FALLBACK_PREFIX: &str = "grp:";

/// Identifier of one logical counterparty thread.
///
/// `dm:<peerInboxId>` when the conversation's peer is resolvable, otherwise
/// the private fallback `grp:<conversationId>` which can never collide with
/// an unrelated handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn direct(peer_inbox_id: &str) -> Self {
        Self(format!("{DIRECT_PREFIX}{peer_inbox_id}"))
    }

    pub fn fallback(conversation_id: &str) -> Self {
        Self(format!("{FALLBACK_PREFIX}{conversation_id}"))
    }

    pub fn is_direct(&self) -> bool {
        self.0.starts_with(DIRECT_PREFIX)
    }

    /// The peer inbox id for direct keys, `None` for fallback keys.
    pub fn peer_inbox_id(&self) -> Option<&str> {
        self.0.strip_prefix(DIRECT_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Conversation-id → canonical-key cache.
///
/// Policy: direct keys are cached permanently. Fallback keys are re-derived
/// on every observation, so a handle whose peer becomes resolvable later
/// migrates to its `dm:` key; whatever accumulated under the fallback key
/// (history, unread) is orphaned in place, never merged.
#[derive(Debug, Default)]
pub(crate) struct KeyCache {
    by_conversation: HashMap<String, CanonicalKey>,
}

impl KeyCache {
    pub fn derive(&mut self, conversation_id: &str, peer_inbox_id: Option<&str>) -> CanonicalKey {
        if let Some(cached) = self.by_conversation.get(conversation_id) {
            if cached.is_direct() {
                return cached.clone();
            }
        }
        let key = match peer_inbox_id {
            Some(peer) => CanonicalKey::direct(peer),
            None => CanonicalKey::fallback(conversation_id),
        };
        self.by_conversation
            .insert(conversation_id.to_string(), key.clone());
        key
    }

    pub fn get(&self, conversation_id: &str) -> Option<&CanonicalKey> {
        self.by_conversation.get(conversation_id)
    }
}
