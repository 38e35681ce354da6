//! Conversation reconciliation engine for Barter's peer-to-peer messaging.
//!
//! Collapses the duplicate conversation objects an external messaging
//! network may hold for one counterparty into a single consent-gated,
//! unread-tracked thread, merging message data from listing, polling, the
//! live stream and post-send refetches into one consistent view.

mod actions;
mod consent;
mod core;
mod error;
mod identity;
mod keys;
mod logging;
mod network;
mod state;
mod store;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use actions::ChatAction;
pub use error::ChatError;
pub use identity::LocalIdentity;
pub use keys::CanonicalKey;
pub use network::{
    ConsentState, ConversationHandle, Message, MessageSubscription, MessagingNetwork,
    NetworkError, StreamEvent, WireMessage, CONTENT_TYPE_TEXT,
};
pub use state::{
    ChatState, ConversationSummary, EnginePhase, RequestSummary, SelectedThread, ThreadMessage,
};
pub use updates::ChatUpdate;

use crate::updates::CoreMsg;

/// Receives incremental updates from the engine on a dedicated thread.
pub trait ChatReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: ChatUpdate);
}

/// Handle to one running reconciliation engine.
///
/// All chat state is owned by a single actor behind this handle, not by
/// module-level registries, so several independent engines can coexist in
/// one process (tests do exactly that). The handle is cheap to share and
/// none of its methods block on the actor.
pub struct ChatEngine {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<ChatUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<ChatState>>,
}

impl ChatEngine {
    /// Spawn the engine for `identity` on `network`. Configuration is read
    /// from `<data_dir>/barter_config.json`, with defaults when the file is
    /// absent. The initial sync starts immediately.
    pub fn new(
        network: Arc<dyn MessagingNetwork>,
        identity: LocalIdentity,
        data_dir: String,
    ) -> Self {
        logging::init_logging();
        tracing::info!(address = %identity.address, "ChatEngine::new");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(ChatState::empty()));

        // Actor loop thread: the single owner of all chat state.
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = crate::core::ChatCore::new(
                update_tx,
                core_tx_for_core,
                network,
                identity,
                data_dir,
                shared_for_core,
            );
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
        });

        let engine = Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
        };
        engine.dispatch(ChatAction::Start);
        engine
    }

    /// Latest state snapshot; never waits on the actor.
    pub fn state(&self) -> ChatState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    /// Contract: never blocks the caller.
    pub fn dispatch(&self, action: ChatAction) {
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    /// Attach the update listener. Only the first call wins; a second
    /// listener would split the update stream.
    pub fn listen_for_updates(&self, reconciler: Box<dyn ChatReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }

    /// Tear the session down: cancels the live stream, stops scheduling
    /// polls, and discards the results of in-flight operations.
    pub fn shutdown(&self) {
        self.dispatch(ChatAction::Shutdown);
    }
}
