//! Capability contract of the external messaging network.
//!
//! The engine never talks to a wire protocol; it consumes an account-bound
//! client through [`MessagingNetwork`] and per-conversation capabilities
//! through [`ConversationHandle`]. Everything that crosses this boundary is
//! normalized exactly once ([`Message::from_wire`]) so downstream code never
//! branches on object shape.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Network-tracked permission level for a conversation. Mutable over time
/// by either party; the engine only ever writes `Allowed` (accept).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsentState {
    Allowed,
    Unknown,
    Denied,
}

/// Error surface of the network client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The looked-up entity does not exist (peer never registered, no such
    /// conversation). Expected; not retryable until the peer acts.
    #[error("not found")]
    NotFound,
    /// Connectivity-class failure. The operation may be retried.
    #[error("{0}")]
    Transient(String),
}

impl NetworkError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Content type tag the engine renders directly.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// A message as the network hands it over. Shape varies by call path
/// (list, stream, refetch), so every field is optional; [`Message::from_wire`]
/// is the only place that decides validity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    pub id: Option<String>,
    pub conversation_id: Option<String>,
    pub sender_inbox_id: Option<String>,
    pub content: Option<String>,
    pub content_type: Option<String>,
    pub fallback: Option<String>,
    /// Network-native send timestamp, nanoseconds.
    pub sent_at_ns: Option<i64>,
}

/// A validated message. Immutable once observed; `id` is the deduplication
/// key across every delivery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub sender_inbox_id: String,
    pub content: String,
    pub content_type: String,
    pub fallback: Option<String>,
    pub sent_at_ns: i64,
}

impl Message {
    /// Normalize a wire message. A message missing id, sender, content or
    /// timestamp is dropped with a diagnostic and never reaches the store.
    pub fn from_wire(wire: WireMessage) -> Option<Message> {
        let WireMessage {
            id,
            conversation_id: _,
            sender_inbox_id,
            content,
            content_type,
            fallback,
            sent_at_ns,
        } = wire;
        match (id, sender_inbox_id, content, sent_at_ns) {
            (Some(id), Some(sender_inbox_id), Some(content), Some(sent_at_ns)) => Some(Message {
                id,
                sender_inbox_id,
                content,
                content_type: content_type.unwrap_or_else(|| CONTENT_TYPE_TEXT.to_string()),
                fallback,
                sent_at_ns,
            }),
            (id, sender, content, ts) => {
                tracing::warn!(
                    id = ?id,
                    sender = ?sender,
                    has_content = content.is_some(),
                    sent_at_ns = ?ts,
                    "dropping malformed message"
                );
                None
            }
        }
    }

    /// Text the UI should render, if any: the content itself for supported
    /// types, the fallback otherwise. `None` means an ignorable event
    /// (read receipts and the like) that stays out of the thread view.
    pub fn display_text(&self) -> Option<&str> {
        if self.content_type == CONTENT_TYPE_TEXT {
            Some(&self.content)
        } else {
            self.fallback.as_deref()
        }
    }
}

/// One delivery from the live message stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message(WireMessage),
    Error(String),
}

/// Handle to a live message subscription. The reconciliation loop always
/// calls [`MessageSubscription::cancel`] on teardown; dropping without
/// cancelling leaves the network side running.
pub struct MessageSubscription {
    events: mpsc::Receiver<StreamEvent>,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl MessageSubscription {
    pub fn new(
        events: mpsc::Receiver<StreamEvent>,
        canceller: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            canceller: Some(Box::new(canceller)),
        }
    }

    /// Next stream event; `None` once the network side hung up.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }
}

impl fmt::Debug for MessageSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSubscription")
            .field("cancelled", &self.canceller.is_none())
            .finish()
    }
}

/// One network-side conversation object. Multiple handles may refer to the
/// same logical counterparty; the engine collapses them by canonical key
/// and never deletes a handle, only supersedes it.
#[async_trait]
pub trait ConversationHandle: fmt::Debug + Send + Sync {
    /// Network-assigned stable conversation id.
    fn id(&self) -> String;

    /// The other party's inbox id for a direct conversation. Fails for
    /// multi-party conversations or when the network cannot introspect
    /// the peer.
    async fn peer_inbox_id(&self) -> Result<String, NetworkError>;

    async fn consent_state(&self) -> Result<ConsentState, NetworkError>;

    async fn set_consent_state(&self, state: ConsentState) -> Result<(), NetworkError>;

    async fn list_messages(&self) -> Result<Vec<WireMessage>, NetworkError>;

    async fn send(&self, text: &str) -> Result<(), NetworkError>;
}

/// The external messaging network client, bound to the local account.
#[async_trait]
pub trait MessagingNetwork: Send + Sync + 'static {
    /// The local account's inbox id.
    fn local_inbox_id(&self) -> String;

    /// Pull remote conversation state into the client's local cache; must
    /// run before `list_conversations` to observe fresh state.
    async fn sync_all(&self) -> Result<(), NetworkError>;

    async fn list_conversations(&self) -> Result<Vec<Arc<dyn ConversationHandle>>, NetworkError>;

    async fn create_direct_conversation(
        &self,
        address: &str,
    ) -> Result<Arc<dyn ConversationHandle>, NetworkError>;

    async fn direct_conversation_by_peer(
        &self,
        peer_inbox_id: &str,
    ) -> Result<Option<Arc<dyn ConversationHandle>>, NetworkError>;

    /// `NotFound` here is the expected "peer has no messaging account yet"
    /// case and must stay distinguishable from transient failures.
    async fn resolve_inbox_id(&self, address: &str) -> Result<String, NetworkError>;

    async fn resolve_address(&self, inbox_id: &str) -> Result<String, NetworkError>;

    /// Subscribe to the network-wide live message stream.
    async fn subscribe_messages(&self) -> Result<MessageSubscription, NetworkError>;
}
