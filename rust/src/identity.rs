//! Local identity and the reverse identity cache used for display labels.

use std::collections::HashMap;

/// The local account as supplied by the wallet layer.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Wallet address of the signed-in account.
    pub address: String,
}

impl LocalIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// inbox id → wallet address cache, display-only. A miss degrades the label
/// to the raw inbox id; correctness never depends on a lookup succeeding.
#[derive(Debug, Default)]
pub(crate) struct AddressBook {
    by_inbox: HashMap<String, String>,
}

impl AddressBook {
    pub fn seed(&mut self, inbox_id: &str, address: &str) {
        self.by_inbox
            .insert(inbox_id.to_string(), address.to_string());
    }

    pub fn contains(&self, inbox_id: &str) -> bool {
        self.by_inbox.contains_key(inbox_id)
    }

    /// Display identifier for a thread: the peer's address when known, the
    /// peer inbox id otherwise, the conversation id for threads whose peer
    /// was never resolvable.
    pub fn display_for(&self, peer_inbox_id: Option<&str>, conversation_id: &str) -> String {
        match peer_inbox_id {
            Some(inbox) => self
                .by_inbox
                .get(inbox)
                .cloned()
                .unwrap_or_else(|| inbox.to_string()),
            None => conversation_id.to_string(),
        }
    }
}
