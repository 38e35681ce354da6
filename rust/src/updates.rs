use crate::actions::ChatAction;
use crate::consent::Observation;
use crate::error::ChatError;
use crate::keys::CanonicalKey;
use crate::network::{NetworkError, WireMessage};
use crate::state::{
    ChatState, ConversationSummary, EnginePhase, RequestSummary, SelectedThread,
};

/// Incremental state notifications delivered to the engine's listener.
#[derive(Debug, Clone)]
pub enum ChatUpdate {
    FullState(ChatState),
    PhaseChanged {
        rev: u64,
        phase: EnginePhase,
    },
    ConversationsChanged {
        rev: u64,
        conversations: Vec<ConversationSummary>,
        requests: Vec<RequestSummary>,
    },
    SelectedChanged {
        rev: u64,
        selected: Option<SelectedThread>,
    },
    ErrorChanged {
        rev: u64,
        error: Option<ChatError>,
    },
}

impl ChatUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            ChatUpdate::FullState(s) => s.rev,
            ChatUpdate::PhaseChanged { rev, .. } => *rev,
            ChatUpdate::ConversationsChanged { rev, .. } => *rev,
            ChatUpdate::SelectedChanged { rev, .. } => *rev,
            ChatUpdate::ErrorChanged { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub(crate) enum CoreMsg {
    Action(ChatAction),
    Internal(Box<InternalEvent>),
}

/// Results of spawned network tasks, funneled back into the actor. Every
/// variant carries the session token it was started under; the actor
/// discards results whose token no longer matches (teardown or restart
/// happened while the task was in flight).
#[derive(Debug)]
pub(crate) enum InternalEvent {
    // Sync / poll path
    SyncCompleted {
        token: u64,
        observations: Vec<Observation>,
        selected_refetch: Option<(CanonicalKey, Vec<WireMessage>)>,
    },
    SyncFailed {
        token: u64,
        error: String,
    },
    PollTick {
        token: u64,
    },

    // Live stream path
    StreamMessage {
        token: u64,
        message: WireMessage,
    },
    StreamLost {
        token: u64,
        error: String,
    },

    // Per-conversation async results
    HistoryFetched {
        token: u64,
        key: CanonicalKey,
        result: Result<Vec<WireMessage>, NetworkError>,
    },
    SendFinished {
        token: u64,
        key: CanonicalKey,
        result: Result<(), NetworkError>,
    },
    ConsentUpdated {
        token: u64,
        key: CanonicalKey,
        conversation_id: String,
        result: Result<(), NetworkError>,
    },

    // Start-chat path
    InboxResolved {
        token: u64,
        address: String,
        result: Result<String, NetworkError>,
    },
    ConversationOpened {
        token: u64,
        address: String,
        result: Result<Observation, NetworkError>,
    },

    // Display identity path
    AddressResolved {
        token: u64,
        inbox_id: String,
        result: Result<String, NetworkError>,
    },
}

impl InternalEvent {
    pub fn token(&self) -> u64 {
        match self {
            InternalEvent::SyncCompleted { token, .. }
            | InternalEvent::SyncFailed { token, .. }
            | InternalEvent::PollTick { token }
            | InternalEvent::StreamMessage { token, .. }
            | InternalEvent::StreamLost { token, .. }
            | InternalEvent::HistoryFetched { token, .. }
            | InternalEvent::SendFinished { token, .. }
            | InternalEvent::ConsentUpdated { token, .. }
            | InternalEvent::InboxResolved { token, .. }
            | InternalEvent::ConversationOpened { token, .. }
            | InternalEvent::AddressResolved { token, .. } => *token,
        }
    }
}
