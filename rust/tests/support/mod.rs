#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use barter_core::{
    ConsentState, ConversationHandle, MessageSubscription, MessagingNetwork, NetworkError,
    StreamEvent, WireMessage, CONTENT_TYPE_TEXT,
};
use tokio::sync::mpsc;

pub fn wire_message(
    id: &str,
    conversation_id: &str,
    sender_inbox_id: &str,
    text: &str,
    sent_at_ns: i64,
) -> WireMessage {
    WireMessage {
        id: Some(id.to_string()),
        conversation_id: Some(conversation_id.to_string()),
        sender_inbox_id: Some(sender_inbox_id.to_string()),
        content: Some(text.to_string()),
        content_type: Some(CONTENT_TYPE_TEXT.to_string()),
        fallback: None,
        sent_at_ns: Some(sent_at_ns),
    }
}

/// One fake network-side conversation. Attributes are mutable mid-test to
/// exercise consent changes and late peer resolution.
#[derive(Debug)]
pub struct MockConversation {
    id: String,
    peer_inbox_id: Mutex<Option<String>>,
    consent: Mutex<ConsentState>,
    messages: Mutex<Vec<WireMessage>>,
    sender_for_sends: Mutex<String>,
    fail_sends: Mutex<Option<NetworkError>>,
    next_send_ts: AtomicI64,
}

impl MockConversation {
    pub fn new(id: &str, peer_inbox_id: Option<&str>, consent: ConsentState) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            peer_inbox_id: Mutex::new(peer_inbox_id.map(str::to_string)),
            consent: Mutex::new(consent),
            messages: Mutex::new(vec![]),
            sender_for_sends: Mutex::new("mock-local".to_string()),
            fail_sends: Mutex::new(None),
            next_send_ts: AtomicI64::new(1_000_000),
        })
    }

    pub fn set_peer(&self, peer_inbox_id: &str) {
        *self.peer_inbox_id.lock().unwrap() = Some(peer_inbox_id.to_string());
    }

    pub fn peer(&self) -> Option<String> {
        self.peer_inbox_id.lock().unwrap().clone()
    }

    pub fn consent(&self) -> ConsentState {
        *self.consent.lock().unwrap()
    }

    pub fn set_sender_for_sends(&self, inbox_id: &str) {
        *self.sender_for_sends.lock().unwrap() = inbox_id.to_string();
    }

    pub fn set_fail_sends(&self, error: Option<NetworkError>) {
        *self.fail_sends.lock().unwrap() = error;
    }

    pub fn push_message(&self, message: WireMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

#[async_trait]
impl ConversationHandle for MockConversation {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn peer_inbox_id(&self) -> Result<String, NetworkError> {
        self.peer_inbox_id
            .lock()
            .unwrap()
            .clone()
            .ok_or(NetworkError::NotFound)
    }

    async fn consent_state(&self) -> Result<ConsentState, NetworkError> {
        Ok(*self.consent.lock().unwrap())
    }

    async fn set_consent_state(&self, state: ConsentState) -> Result<(), NetworkError> {
        *self.consent.lock().unwrap() = state;
        Ok(())
    }

    async fn list_messages(&self) -> Result<Vec<WireMessage>, NetworkError> {
        Ok(self.messages.lock().unwrap().clone())
    }

    async fn send(&self, text: &str) -> Result<(), NetworkError> {
        if let Some(error) = self.fail_sends.lock().unwrap().clone() {
            return Err(error);
        }
        let ts = self.next_send_ts.fetch_add(1, Ordering::SeqCst);
        let sender = self.sender_for_sends.lock().unwrap().clone();
        let id = uuid::Uuid::new_v4().to_string();
        self.push_message(wire_message(&id, &self.id, &sender, text, ts));
        Ok(())
    }
}

/// In-memory messaging network: identities and conversations registered up
/// front or mid-test, stream deliveries pushed explicitly.
#[derive(Clone)]
pub struct MockNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    local_inbox_id: String,
    // (address, inbox id); addresses matched case-insensitively
    identities: Mutex<Vec<(String, String)>>,
    conversations: Mutex<Vec<Arc<MockConversation>>>,
    stream_senders: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
    cancelled_streams: AtomicUsize,
    fail_sync: AtomicBool,
    sync_calls: AtomicUsize,
}

impl MockNetwork {
    pub fn new(local_inbox_id: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_inbox_id: local_inbox_id.to_string(),
                identities: Mutex::new(vec![]),
                conversations: Mutex::new(vec![]),
                stream_senders: Mutex::new(vec![]),
                cancelled_streams: AtomicUsize::new(0),
                fail_sync: AtomicBool::new(false),
                sync_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn register_identity(&self, address: &str, inbox_id: &str) {
        self.inner
            .identities
            .lock()
            .unwrap()
            .push((address.to_string(), inbox_id.to_string()));
    }

    pub fn add_conversation(&self, conversation: Arc<MockConversation>) {
        self.inner.conversations.lock().unwrap().push(conversation);
    }

    pub fn conversation_count(&self) -> usize {
        self.inner.conversations.lock().unwrap().len()
    }

    /// Deliver a message on every live stream subscription.
    pub fn push_stream_message(&self, message: WireMessage) {
        let senders = self.inner.stream_senders.lock().unwrap().clone();
        for tx in senders {
            let _ = tx.try_send(StreamEvent::Message(message.clone()));
        }
    }

    pub fn cancelled_streams(&self) -> usize {
        self.inner.cancelled_streams.load(Ordering::SeqCst)
    }

    /// Number of live stream subscriptions; tests wait on this before
    /// pushing so a delivery can't race the engine's subscribe call.
    pub fn stream_subscriptions(&self) -> usize {
        self.inner.stream_senders.lock().unwrap().len()
    }

    pub fn set_fail_sync(&self, fail: bool) {
        self.inner.fail_sync.store(fail, Ordering::SeqCst);
    }

    pub fn sync_calls(&self) -> usize {
        self.inner.sync_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingNetwork for MockNetwork {
    fn local_inbox_id(&self) -> String {
        self.inner.local_inbox_id.clone()
    }

    async fn sync_all(&self) -> Result<(), NetworkError> {
        self.inner.sync_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_sync.load(Ordering::SeqCst) {
            return Err(NetworkError::transient("relay unreachable"));
        }
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<Arc<dyn ConversationHandle>>, NetworkError> {
        Ok(self
            .inner
            .conversations
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.clone() as Arc<dyn ConversationHandle>)
            .collect())
    }

    async fn create_direct_conversation(
        &self,
        address: &str,
    ) -> Result<Arc<dyn ConversationHandle>, NetworkError> {
        let inbox_id = self.lookup_inbox(address).ok_or(NetworkError::NotFound)?;
        let conversation = MockConversation::new(
            &uuid::Uuid::new_v4().to_string(),
            Some(&inbox_id),
            ConsentState::Allowed,
        );
        conversation.set_sender_for_sends(&self.inner.local_inbox_id);
        self.add_conversation(conversation.clone());
        Ok(conversation)
    }

    async fn direct_conversation_by_peer(
        &self,
        peer_inbox_id: &str,
    ) -> Result<Option<Arc<dyn ConversationHandle>>, NetworkError> {
        Ok(self
            .inner
            .conversations
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.peer().as_deref() == Some(peer_inbox_id))
            .map(|c| c.clone() as Arc<dyn ConversationHandle>))
    }

    async fn resolve_inbox_id(&self, address: &str) -> Result<String, NetworkError> {
        self.lookup_inbox(address).ok_or(NetworkError::NotFound)
    }

    async fn resolve_address(&self, inbox_id: &str) -> Result<String, NetworkError> {
        self.inner
            .identities
            .lock()
            .unwrap()
            .iter()
            .find(|(_, inbox)| inbox == inbox_id)
            .map(|(address, _)| address.clone())
            .ok_or(NetworkError::NotFound)
    }

    async fn subscribe_messages(&self) -> Result<MessageSubscription, NetworkError> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.stream_senders.lock().unwrap().push(tx);
        let inner = self.inner.clone();
        Ok(MessageSubscription::new(rx, move || {
            inner.cancelled_streams.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

impl MockNetwork {
    fn lookup_inbox(&self, address: &str) -> Option<String> {
        self.inner
            .identities
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a.eq_ignore_ascii_case(address))
            .map(|(_, inbox)| inbox.clone())
    }
}
