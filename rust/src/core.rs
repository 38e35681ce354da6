use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::Context as _;
use flume::Sender;
use tokio::sync::watch;

use crate::actions::ChatAction;
use crate::consent::{self, Observation, ThreadRecord};
use crate::error::ChatError;
use crate::identity::{AddressBook, LocalIdentity};
use crate::keys::{CanonicalKey, KeyCache};
use crate::network::{
    ConsentState, ConversationHandle, MessagingNetwork, NetworkError, StreamEvent, WireMessage,
};
use crate::state::{
    ChatState, ConversationSummary, EnginePhase, RequestSummary, SelectedThread, ThreadMessage,
};
use crate::store::{MessageStore, UnreadTracker};
use crate::updates::{ChatUpdate, CoreMsg, InternalEvent};

mod config;

use config::EngineConfig;

/// Stream deliveries for conversations no sync has registered yet are held
/// back until the next sync; bound the buffer so a conversation that never
/// materializes cannot grow it forever.
const PENDING_STREAM_MAX_PER_CONVERSATION: usize = 64;

/// Per-session plumbing. Replaced wholesale on restart; dropping the watch
/// sender wakes every task spawned under this session.
struct Session {
    token: u64,
    shutdown_tx: watch::Sender<bool>,
    stream_down: bool,
}

/// The reconciliation loop. Owns every piece of chat state and runs on a
/// single actor thread; network calls are spawned onto the runtime and
/// their results come back through `core_sender` as internal events.
pub(crate) struct ChatCore {
    state: ChatState,
    rev: u64,

    update_sender: Sender<ChatUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<ChatState>>,

    network: Arc<dyn MessagingNetwork>,
    identity: LocalIdentity,
    my_inbox_id: String,
    config: EngineConfig,
    runtime: tokio::runtime::Runtime,

    session: Option<Session>,
    session_token: u64,

    // Reconciled state, all keyed by canonical key.
    key_cache: KeyCache,
    records: HashMap<CanonicalKey, ThreadRecord>,
    requests: Vec<ThreadRecord>,
    store: MessageStore,
    unread: UnreadTracker,
    address_book: AddressBook,
    selected: Option<CanonicalKey>,

    sync_in_flight: bool,
    sync_dirty: bool,
    // conversation id -> buffered stream deliveries awaiting registration
    pending_stream: HashMap<String, Vec<WireMessage>>,
    // inbox ids with a display lookup in flight
    resolving_addresses: HashSet<String>,
}

impl ChatCore {
    pub(crate) fn new(
        update_sender: Sender<ChatUpdate>,
        core_sender: Sender<CoreMsg>,
        network: Arc<dyn MessagingNetwork>,
        identity: LocalIdentity,
        data_dir: String,
        shared_state: Arc<RwLock<ChatState>>,
    ) -> Self {
        let config = config::load_engine_config(&data_dir);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .expect("tokio runtime");

        let my_inbox_id = network.local_inbox_id();

        let this = Self {
            state: ChatState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            network,
            identity,
            my_inbox_id,
            config,
            runtime,
            session: None,
            session_token: 0,
            key_cache: KeyCache::default(),
            records: HashMap::new(),
            requests: Vec::new(),
            store: MessageStore::default(),
            unread: UnreadTracker::default(),
            address_book: AddressBook::default(),
            selected: None,
            sync_in_flight: false,
            sync_dirty: false,
            pending_stream: HashMap::new(),
            resolving_addresses: HashSet::new(),
        };

        // Ensure ChatEngine::state() has an immediately-available snapshot.
        this.commit_state();
        this
    }

    pub(crate) fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    // ------------------------------------------------------------------
    // Emit plumbing
    // ------------------------------------------------------------------

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn emit(&mut self, update: ChatUpdate) {
        self.commit_state();
        let _ = self.update_sender.send(update);
    }

    fn commit_state(&self) {
        let snapshot = self.state.clone();
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot,
            Err(poison) => *poison.into_inner() = snapshot,
        }
    }

    fn emit_phase(&mut self) {
        let rev = self.next_rev();
        self.emit(ChatUpdate::PhaseChanged {
            rev,
            phase: self.state.phase,
        });
    }

    fn emit_conversations(&mut self) {
        self.rebuild_lists();
        let rev = self.next_rev();
        self.emit(ChatUpdate::ConversationsChanged {
            rev,
            conversations: self.state.conversations.clone(),
            requests: self.state.requests.clone(),
        });
    }

    fn emit_selected(&mut self) {
        self.rebuild_selected();
        let rev = self.next_rev();
        self.emit(ChatUpdate::SelectedChanged {
            rev,
            selected: self.state.selected.clone(),
        });
    }

    fn emit_error(&mut self) {
        let rev = self.next_rev();
        self.emit(ChatUpdate::ErrorChanged {
            rev,
            error: self.state.error.clone(),
        });
    }

    fn fail(&mut self, error: ChatError) {
        tracing::warn!(%error, "operation failed");
        self.state.error = Some(error);
        self.emit_error();
    }

    fn set_phase(&mut self, phase: EnginePhase) {
        if self.state.phase != phase {
            self.state.phase = phase;
            self.emit_phase();
        }
    }

    // ------------------------------------------------------------------
    // Derived UI slices
    // ------------------------------------------------------------------

    fn rebuild_lists(&mut self) {
        let mut conversations: Vec<ConversationSummary> = self
            .records
            .values()
            .map(|r| ConversationSummary {
                key: r.key.clone(),
                display: self
                    .address_book
                    .display_for(r.peer_inbox_id.as_deref(), &r.conversation_id),
                unread_count: self.unread.count(&r.key),
                last_message_at_ns: self.store.last_sent_at_ns(&r.key),
            })
            .collect();
        conversations.sort_by(|a, b| {
            b.last_message_at_ns
                .cmp(&a.last_message_at_ns)
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut requests: Vec<RequestSummary> = self
            .requests
            .iter()
            .map(|r| RequestSummary {
                key: r.key.clone(),
                display: self
                    .address_book
                    .display_for(r.peer_inbox_id.as_deref(), &r.conversation_id),
                consent: r.consent,
            })
            .collect();
        requests.sort_by(|a, b| a.key.cmp(&b.key));

        self.state.conversations = conversations;
        self.state.requests = requests;
    }

    fn rebuild_selected(&mut self) {
        let Some(key) = self.selected.clone() else {
            self.state.selected = None;
            return;
        };

        let display = match self.records.get(&key) {
            Some(r) => self
                .address_book
                .display_for(r.peer_inbox_id.as_deref(), &r.conversation_id),
            None => self
                .address_book
                .display_for(key.peer_inbox_id(), key.as_str()),
        };

        let messages: Vec<ThreadMessage> = self
            .store
            .messages(&key)
            .iter()
            .filter_map(|m| {
                let text = m.display_text()?;
                Some(ThreadMessage {
                    id: m.id.clone(),
                    sender_inbox_id: m.sender_inbox_id.clone(),
                    text: text.to_string(),
                    sent_at_ns: m.sent_at_ns,
                    is_mine: m.sender_inbox_id.eq_ignore_ascii_case(&self.my_inbox_id),
                })
            })
            .collect();

        self.state.selected = Some(SelectedThread {
            key,
            display,
            messages,
        });
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    fn handle_action(&mut self, action: ChatAction) {
        match action {
            ChatAction::Start => self.start(),
            ChatAction::SelectConversation { key } => self.select_conversation(key),
            ChatAction::StartChat { address } => self.start_chat(address),
            ChatAction::SendMessage { text } => self.send_message(text),
            ChatAction::AcceptRequest { key } => self.accept_request(key),
            ChatAction::ClearError => {
                if self.state.error.is_some() {
                    self.state.error = None;
                    self.emit_error();
                }
            }
            ChatAction::Shutdown => self.shutdown(),
        }
    }

    fn start(&mut self) {
        if self.session.is_some() {
            tracing::debug!("start ignored, session already running");
            return;
        }
        if self.state.phase == EnginePhase::Terminating {
            tracing::debug!("start ignored after teardown");
            return;
        }

        self.session_token = self.session_token.wrapping_add(1);
        let (shutdown_tx, _) = watch::channel(false);
        self.session = Some(Session {
            token: self.session_token,
            shutdown_tx,
            stream_down: false,
        });

        tracing::info!(
            address = %self.identity.address,
            inbox = %self.my_inbox_id,
            "session started"
        );
        self.set_phase(EnginePhase::Syncing);

        // Stream first so nothing delivered during the initial sync is lost;
        // deliveries for still-unknown conversations are buffered.
        self.spawn_stream_task();
        self.spawn_poll_timer();
        self.spawn_sync();
    }

    fn shutdown(&mut self) {
        self.set_phase(EnginePhase::Terminating);
        self.stop_session();
    }

    fn stop_session(&mut self) {
        // Invalidate every in-flight task result before waking the tasks.
        self.session_token = self.session_token.wrapping_add(1);
        self.sync_in_flight = false;
        self.sync_dirty = false;
        if let Some(sess) = self.session.take() {
            let _ = sess.shutdown_tx.send(true);
            // Dropping the sender wakes any task still waiting on it.
        }
    }

    fn select_conversation(&mut self, key: CanonicalKey) {
        let known =
            self.records.contains_key(&key) || self.requests.iter().any(|r| r.key == key);
        if !known {
            self.fail(ChatError::UnknownConversation {
                key: key.to_string(),
            });
            return;
        }

        // Selection change and unread reset are one actor step; a merge can
        // never observe the new selection with a stale counter.
        self.selected = Some(key.clone());
        self.unread.reset(&key);
        self.emit_conversations();
        self.emit_selected();
        self.spawn_history_fetch(key);
    }

    fn start_chat(&mut self, address: String) {
        let address = address.trim().to_string();
        if address.is_empty() {
            return;
        }
        let Some(token) = self.session_token_if_running() else {
            self.fail(ChatError::network("start chat", "engine is not running"));
            return;
        };

        let network = self.network.clone();
        let tx = self.core_sender.clone();
        tracing::info!(%address, "start_chat: resolving inbox id");
        self.runtime.spawn(async move {
            let result = network.resolve_inbox_id(&address).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::InboxResolved {
                token,
                address,
                result,
            })));
        });
    }

    fn send_message(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        let Some(key) = self.selected.clone() else {
            self.fail(ChatError::NoSelection);
            return;
        };
        let Some(handle) = self.handle_for(&key) else {
            self.fail(ChatError::UnknownConversation {
                key: key.to_string(),
            });
            return;
        };
        let Some(token) = self.session_token_if_running() else {
            return;
        };

        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            if let Err(e) = handle.send(&text).await {
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SendFinished {
                    token,
                    key,
                    result: Err(e),
                })));
                return;
            }
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SendFinished {
                token,
                key: key.clone(),
                result: Ok(()),
            })));
            // Not every network echoes sent messages on the live stream;
            // refetch so the send shows up without waiting for a poll.
            let result = handle.list_messages().await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::HistoryFetched {
                token,
                key,
                result,
            })));
        });
    }

    fn accept_request(&mut self, key: CanonicalKey) {
        let Some(record) = self.requests.iter().find(|r| r.key == key).cloned() else {
            self.fail(ChatError::UnknownRequest {
                key: key.to_string(),
            });
            return;
        };
        let Some(token) = self.session_token_if_running() else {
            return;
        };

        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = record.handle.set_consent_state(ConsentState::Allowed).await;
            let accepted = result.is_ok();
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::ConsentUpdated {
                token,
                key: key.clone(),
                conversation_id: record.conversation_id.clone(),
                result,
            })));
            if accepted {
                let result = record.handle.list_messages().await;
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::HistoryFetched {
                    token,
                    key,
                    result,
                })));
            }
        });
    }

    // ------------------------------------------------------------------
    // Internal events
    // ------------------------------------------------------------------

    fn handle_internal(&mut self, internal: InternalEvent) {
        // A result from a torn-down or superseded session must not mutate
        // state, no matter when its task settles.
        if !self.token_is_current(internal.token()) {
            tracing::debug!("discarding stale internal event");
            return;
        }

        match internal {
            InternalEvent::SyncCompleted {
                observations,
                selected_refetch,
                ..
            } => {
                self.sync_in_flight = false;
                self.apply_observations(observations);
                if let Some((key, messages)) = selected_refetch {
                    self.merge_incoming(&key, messages);
                }
                self.drain_pending_stream();
                if self.state.phase == EnginePhase::Syncing {
                    self.set_phase(EnginePhase::Live);
                }
                if self.sync_dirty {
                    self.sync_dirty = false;
                    self.spawn_sync();
                }
            }
            InternalEvent::SyncFailed { error, .. } => {
                self.sync_in_flight = false;
                self.fail(ChatError::Network {
                    context: "sync conversations",
                    message: error,
                });
                if self.sync_dirty {
                    self.sync_dirty = false;
                    self.spawn_sync();
                }
            }
            InternalEvent::PollTick { .. } => {
                if matches!(self.state.phase, EnginePhase::Syncing | EnginePhase::Live) {
                    if self.session.as_ref().map(|s| s.stream_down).unwrap_or(false) {
                        self.spawn_stream_task();
                    }
                    self.spawn_sync();
                }
            }
            InternalEvent::StreamMessage { message, .. } => {
                let Some(conversation_id) = message.conversation_id.clone() else {
                    tracing::warn!("dropping stream message without conversation id");
                    return;
                };
                match self.key_cache.get(&conversation_id).cloned() {
                    Some(key) => self.merge_incoming(&key, vec![message]),
                    None => {
                        // Counterparty created the conversation between
                        // polls; buffer until a sync registers it.
                        tracing::debug!(
                            conversation = %conversation_id,
                            "buffering stream message for unknown conversation"
                        );
                        let buffer = self.pending_stream.entry(conversation_id).or_default();
                        if buffer.len() < PENDING_STREAM_MAX_PER_CONVERSATION {
                            buffer.push(message);
                        }
                        self.spawn_sync();
                    }
                }
            }
            InternalEvent::StreamLost { error, .. } => {
                if let Some(sess) = self.session.as_mut() {
                    sess.stream_down = true;
                }
                self.fail(ChatError::Network {
                    context: "message stream",
                    message: error,
                });
            }
            InternalEvent::HistoryFetched { key, result, .. } => match result {
                Ok(messages) => self.merge_incoming(&key, messages),
                Err(e) => self.fail(ChatError::network("fetch messages", e)),
            },
            InternalEvent::SendFinished { key, result, .. } => match result {
                Ok(()) => tracing::debug!(key = %key, "message sent"),
                Err(e) => self.fail(ChatError::network("send message", e)),
            },
            InternalEvent::ConsentUpdated {
                key,
                conversation_id,
                result,
                ..
            } => {
                if let Err(e) = result {
                    self.fail(ChatError::network("accept request", e));
                    return;
                }
                self.promote_request(key, &conversation_id);
            }
            InternalEvent::InboxResolved {
                address, result, ..
            } => self.finish_inbox_resolution(address, result),
            InternalEvent::ConversationOpened {
                address, result, ..
            } => self.finish_conversation_open(address, result),
            InternalEvent::AddressResolved {
                inbox_id, result, ..
            } => {
                self.resolving_addresses.remove(&inbox_id);
                match result {
                    Ok(address) => {
                        self.address_book.seed(&inbox_id, &address);
                        self.emit_conversations();
                        if self.selected.is_some() {
                            self.emit_selected();
                        }
                    }
                    Err(e) => {
                        tracing::debug!(inbox = %inbox_id, error = %e, "address lookup failed");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    fn spawn_sync(&mut self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        if self.sync_in_flight {
            // A slow sync must not overlap itself; run once more afterwards.
            self.sync_dirty = true;
            return;
        }
        self.sync_in_flight = true;
        self.sync_dirty = false;

        let token = sess.token;
        let network = self.network.clone();
        let tx = self.core_sender.clone();
        let selected = self
            .selected
            .clone()
            .and_then(|key| self.handle_for(&key).map(|handle| (key, handle)));

        self.runtime.spawn(async move {
            match run_sync(network, selected).await {
                Ok((observations, selected_refetch)) => {
                    let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SyncCompleted {
                        token,
                        observations,
                        selected_refetch,
                    })));
                }
                Err(e) => {
                    let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SyncFailed {
                        token,
                        error: format!("{e:#}"),
                    })));
                }
            }
        });
    }

    /// Replace the reconciled lists with a fresh partition. The message
    /// store, unread counters and selection survive untouched; an entry
    /// whose handle migrated from a fallback key to a `dm:` key leaves its
    /// old history orphaned under the fallback key.
    fn apply_observations(&mut self, observations: Vec<Observation>) {
        let keyed: Vec<(CanonicalKey, Observation)> = observations
            .into_iter()
            .map(|obs| {
                let key = self
                    .key_cache
                    .derive(&obs.conversation_id, obs.peer_inbox_id.as_deref());
                (key, obs)
            })
            .collect();

        let (allowed, pending) = consent::partition(&keyed);
        self.records = allowed.into_iter().map(|r| (r.key.clone(), r)).collect();
        self.requests = pending;

        self.queue_address_lookups();
        self.emit_conversations();
        if self.selected.is_some() {
            self.emit_selected();
        }
    }

    fn drain_pending_stream(&mut self) {
        if self.pending_stream.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_stream);
        for (conversation_id, messages) in pending {
            match self.key_cache.get(&conversation_id).cloned() {
                Some(key) => self.merge_incoming(&key, messages),
                None => {
                    // Still unknown; keep buffering for the next sync.
                    self.pending_stream.insert(conversation_id, messages);
                }
            }
        }
    }

    fn queue_address_lookups(&mut self) {
        let Some(token) = self.session_token_if_running() else {
            return;
        };
        let mut inboxes: Vec<String> = Vec::new();
        for r in self.records.values().chain(self.requests.iter()) {
            if let Some(inbox) = &r.peer_inbox_id {
                if !self.address_book.contains(inbox) && !self.resolving_addresses.contains(inbox)
                {
                    inboxes.push(inbox.clone());
                }
            }
        }
        for inbox_id in inboxes {
            self.resolving_addresses.insert(inbox_id.clone());
            let network = self.network.clone();
            let tx = self.core_sender.clone();
            self.runtime.spawn(async move {
                let result = network.resolve_address(&inbox_id).await;
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::AddressResolved {
                    token,
                    inbox_id,
                    result,
                })));
            });
        }
    }

    // ------------------------------------------------------------------
    // Merge path
    // ------------------------------------------------------------------

    fn merge_incoming(&mut self, key: &CanonicalKey, messages: Vec<WireMessage>) {
        let added = self.store.merge_incoming(key, messages);
        if added == 0 {
            return;
        }
        // Selection is read here, at merge time, never from a stream
        // callback's captured state.
        self.unread.record_merge(key, added, self.selected.as_ref());
        self.emit_conversations();
        if self.selected.as_ref() == Some(key) {
            self.emit_selected();
        }
    }

    // ------------------------------------------------------------------
    // Start-chat path
    // ------------------------------------------------------------------

    fn finish_inbox_resolution(&mut self, address: String, result: Result<String, NetworkError>) {
        let peer_inbox_id = match result {
            Ok(inbox) => inbox,
            Err(NetworkError::NotFound) => {
                self.fail(ChatError::PeerNotOnNetwork { address });
                return;
            }
            Err(e) => {
                self.fail(ChatError::network("start chat", e));
                return;
            }
        };

        // The initiator already knows the mapping; label it immediately.
        self.address_book.seed(&peer_inbox_id, &address);

        let key = CanonicalKey::direct(&peer_inbox_id);
        if self.records.contains_key(&key) || self.requests.iter().any(|r| r.key == key) {
            self.select_conversation(key);
            return;
        }

        let Some(token) = self.session_token_if_running() else {
            return;
        };
        let network = self.network.clone();
        let tx = self.core_sender.clone();
        tracing::info!(%address, inbox = %peer_inbox_id, "start_chat: opening direct conversation");
        self.runtime.spawn(async move {
            let result = open_direct(network, &address, &peer_inbox_id).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::ConversationOpened {
                    token,
                    address,
                    result,
                },
            )));
        });
    }

    fn finish_conversation_open(
        &mut self,
        address: String,
        result: Result<Observation, NetworkError>,
    ) {
        let obs = match result {
            Ok(obs) => obs,
            Err(e) => {
                self.fail(ChatError::network("start chat", e));
                return;
            }
        };

        let key = self
            .key_cache
            .derive(&obs.conversation_id, obs.peer_inbox_id.as_deref());
        if self.records.contains_key(&key) || self.requests.iter().any(|r| r.key == key) {
            // A concurrent sync registered it first.
            self.select_conversation(key);
            return;
        }

        tracing::info!(%address, key = %key, "conversation registered");
        let record = ThreadRecord {
            key: key.clone(),
            handle: obs.handle,
            conversation_id: obs.conversation_id,
            peer_inbox_id: obs.peer_inbox_id,
            consent: obs.consent,
        };
        if record.consent == ConsentState::Allowed {
            self.records.insert(key.clone(), record);
        } else {
            self.requests.push(record);
        }

        self.selected = Some(key.clone());
        self.unread.reset(&key);
        self.emit_conversations();
        self.emit_selected();
        self.spawn_history_fetch(key);
    }

    // ------------------------------------------------------------------
    // Accept path
    // ------------------------------------------------------------------

    /// The accepted handle becomes the canonical allowed entry; sibling
    /// requests for the same key disappear with it.
    fn promote_request(&mut self, key: CanonicalKey, conversation_id: &str) {
        let Some(pos) = self
            .requests
            .iter()
            .position(|r| r.conversation_id == conversation_id)
        else {
            // A sync promoted it already.
            return;
        };
        let mut record = self.requests.remove(pos);
        record.consent = ConsentState::Allowed;
        self.requests.retain(|r| r.key != key);
        self.records.entry(key.clone()).or_insert(record);

        self.selected = Some(key.clone());
        self.unread.reset(&key);
        self.emit_conversations();
        self.emit_selected();
        // The accept task follows up with a HistoryFetched event.
    }

    // ------------------------------------------------------------------
    // Spawned tasks
    // ------------------------------------------------------------------

    fn spawn_history_fetch(&mut self, key: CanonicalKey) {
        let Some(handle) = self.handle_for(&key) else {
            return;
        };
        let Some(token) = self.session_token_if_running() else {
            return;
        };
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = handle.list_messages().await;
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::HistoryFetched {
                token,
                key,
                result,
            })));
        });
    }

    fn spawn_stream_task(&mut self) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        sess.stream_down = false;
        let token = sess.token;
        let mut shutdown_rx = sess.shutdown_tx.subscribe();
        let network = self.network.clone();
        let tx = self.core_sender.clone();

        self.runtime.spawn(async move {
            let mut sub = match network.subscribe_messages().await {
                Ok(sub) => sub,
                Err(e) => {
                    let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::StreamLost {
                        token,
                        error: e.to_string(),
                    })));
                    return;
                }
            };
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // Teardown (or the session was dropped): cancel the
                        // network-side subscription before exiting.
                        let _ = changed;
                        sub.cancel();
                        return;
                    }
                    event = sub.recv() => match event {
                        Some(StreamEvent::Message(message)) => {
                            let _ = tx.send(CoreMsg::Internal(Box::new(
                                InternalEvent::StreamMessage { token, message },
                            )));
                        }
                        Some(StreamEvent::Error(error)) => {
                            tracing::warn!(%error, "stream reported an error");
                        }
                        None => {
                            let _ = tx.send(CoreMsg::Internal(Box::new(
                                InternalEvent::StreamLost {
                                    token,
                                    error: "stream ended".into(),
                                },
                            )));
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_poll_timer(&mut self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let token = sess.token;
        let mut shutdown_rx = sess.shutdown_tx.subscribe();
        let tx = self.core_sender.clone();
        let period = self.config.poll_interval();

        self.runtime.spawn(async move {
            // First tick one full period out; session start already syncs.
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = interval.tick() => {
                        if tx
                            .send(CoreMsg::Internal(Box::new(InternalEvent::PollTick { token })))
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn handle_for(&self, key: &CanonicalKey) -> Option<Arc<dyn ConversationHandle>> {
        self.records
            .get(key)
            .map(|r| r.handle.clone())
            .or_else(|| {
                self.requests
                    .iter()
                    .find(|r| &r.key == key)
                    .map(|r| r.handle.clone())
            })
    }

    fn session_token_if_running(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.token)
    }

    fn token_is_current(&self, token: u64) -> bool {
        self.session
            .as_ref()
            .map(|s| s.token == token)
            .unwrap_or(false)
    }
}

/// Full sync pipeline, run off the actor thread. All-or-nothing: any
/// failure (other than per-handle peer introspection, which routes to the
/// fallback key) aborts the whole sync with nothing applied.
async fn run_sync(
    network: Arc<dyn MessagingNetwork>,
    selected: Option<(CanonicalKey, Arc<dyn ConversationHandle>)>,
) -> anyhow::Result<(Vec<Observation>, Option<(CanonicalKey, Vec<WireMessage>)>)> {
    network.sync_all().await.context("sync_all")?;
    let handles = network
        .list_conversations()
        .await
        .context("list conversations")?;

    let mut observations = Vec::with_capacity(handles.len());
    for handle in handles {
        let conversation_id = handle.id();
        let peer_inbox_id = match handle.peer_inbox_id().await {
            Ok(inbox) => Some(inbox),
            Err(e) => {
                // Group conversation, or the network cannot name the peer:
                // the handle gets its private fallback key.
                tracing::debug!(conversation = %conversation_id, error = %e, "peer not resolvable");
                None
            }
        };
        let consent = handle
            .consent_state()
            .await
            .with_context(|| format!("consent state for {conversation_id}"))?;
        observations.push(Observation {
            handle,
            conversation_id,
            peer_inbox_id,
            consent,
        });
    }

    let selected_refetch = match selected {
        Some((key, handle)) => Some((
            key,
            handle
                .list_messages()
                .await
                .context("selected thread history")?,
        )),
        None => None,
    };

    Ok((observations, selected_refetch))
}

/// Open (or create) the direct conversation with a freshly resolved peer.
async fn open_direct(
    network: Arc<dyn MessagingNetwork>,
    address: &str,
    peer_inbox_id: &str,
) -> Result<Observation, NetworkError> {
    let handle = match network.direct_conversation_by_peer(peer_inbox_id).await? {
        Some(existing) => existing,
        None => network.create_direct_conversation(address).await?,
    };
    let conversation_id = handle.id();
    // New handles come up in a network-defined consent state.
    let consent = handle.consent_state().await?;
    Ok(Observation {
        handle,
        conversation_id,
        peer_inbox_id: Some(peer_inbox_id.to_string()),
        consent,
    })
}
