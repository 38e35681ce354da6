use chrono::{DateTime, TimeZone, Utc};

use crate::error::ChatError;
use crate::keys::CanonicalKey;
use crate::network::ConsentState;

/// Reconciliation loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Uninitialized,
    /// Full remote sync in progress; no successful sync applied yet.
    Syncing,
    /// Poll timer and live stream running.
    Live,
    /// Teardown begun; in-flight results are discarded.
    Terminating,
}

/// Snapshot of the whole chat subsystem as the UI sees it.
#[derive(Debug, Clone)]
pub struct ChatState {
    pub rev: u64,
    pub phase: EnginePhase,
    /// Allowed threads, one per canonical key, newest activity first.
    pub conversations: Vec<ConversationSummary>,
    /// Pending requests awaiting an explicit accept. A canonical key may
    /// appear more than once here when several non-allowed handles collapse
    /// onto it.
    pub requests: Vec<RequestSummary>,
    pub selected: Option<SelectedThread>,
    pub error: Option<ChatError>,
}

impl ChatState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            phase: EnginePhase::Uninitialized,
            conversations: vec![],
            requests: vec![],
            selected: None,
            error: None,
        }
    }

    pub fn conversation(&self, key: &CanonicalKey) -> Option<&ConversationSummary> {
        self.conversations.iter().find(|c| &c.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub key: CanonicalKey,
    /// Peer wallet address when resolvable, inbox id or conversation id
    /// otherwise.
    pub display: String,
    pub unread_count: u32,
    pub last_message_at_ns: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub key: CanonicalKey,
    pub display: String,
    /// Distinguishes `Denied` from `Unknown` in the request list.
    pub consent: ConsentState,
}

/// The active thread with its ordered, renderable messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedThread {
    pub key: CanonicalKey,
    pub display: String,
    pub messages: Vec<ThreadMessage>,
}

/// One renderable message. Stored messages without displayable text (read
/// receipts and other unsupported content without fallback) never appear
/// here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub id: String,
    pub sender_inbox_id: String,
    pub text: String,
    pub sent_at_ns: i64,
    pub is_mine: bool,
}

impl ThreadMessage {
    /// Send time as a UTC timestamp; `None` when the nanosecond value is
    /// outside the representable range.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.sent_at_ns.div_euclid(1_000_000_000);
        let nanos = self.sent_at_ns.rem_euclid(1_000_000_000) as u32;
        Utc.timestamp_opt(secs, nanos).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sent_at_converts_nanoseconds() {
        let msg = ThreadMessage {
            id: "m1".into(),
            sender_inbox_id: "ib-b".into(),
            text: "hi".into(),
            sent_at_ns: 1_700_000_000_500_000_000,
            is_mine: false,
        };
        let ts = msg.sent_at().expect("in range");
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn empty_state_starts_uninitialized() {
        let state = ChatState::empty();
        assert_eq!(state.rev, 0);
        assert_eq!(state.phase, EnginePhase::Uninitialized);
        assert!(state.conversations.is_empty());
        assert!(state.selected.is_none());
    }
}
