use crate::keys::CanonicalKey;

/// User-initiated inputs to the reconciliation loop.
#[derive(Debug, Clone)]
pub enum ChatAction {
    /// Begin the session: initial sync, poll timer, live stream.
    /// Dispatched once by `ChatEngine::new`.
    Start,

    /// Make `key` the active thread and zero its unread count.
    SelectConversation { key: CanonicalKey },

    /// Resolve `address` and select or create the direct conversation with
    /// that peer.
    StartChat { address: String },

    /// Send to the currently selected conversation.
    SendMessage { text: String },

    /// Promote a pending request to an accepted thread.
    AcceptRequest { key: CanonicalKey },

    /// Dismiss the current error.
    ClearError,

    /// Tear the session down; no state mutation happens afterwards.
    Shutdown,
}

impl ChatAction {
    /// Log-safe action tag (never includes message text or addresses).
    pub fn tag(&self) -> &'static str {
        match self {
            ChatAction::Start => "Start",
            ChatAction::SelectConversation { .. } => "SelectConversation",
            ChatAction::StartChat { .. } => "StartChat",
            ChatAction::SendMessage { .. } => "SendMessage",
            ChatAction::AcceptRequest { .. } => "AcceptRequest",
            ChatAction::ClearError => "ClearError",
            ChatAction::Shutdown => "Shutdown",
        }
    }
}
