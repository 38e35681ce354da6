//! User-visible error slot for the chat engine.

use std::fmt;

/// Failure surfaced to the UI. One slot in [`crate::ChatState`], overwritten
/// by the latest failure and cleared by `ChatAction::ClearError`; the failed
/// operation is always left retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// The address has no account on the messaging network. Expected and
    /// non-retryable until the peer registers; never conflated with
    /// connectivity failures.
    #[error("{address} is not reachable on the messaging network")]
    PeerNotOnNetwork { address: String },

    /// Connectivity-class failure in `context`; retry is safe.
    #[error("{context} failed: {message}")]
    Network {
        context: &'static str,
        message: String,
    },

    #[error("conversation {key} is not known")]
    UnknownConversation { key: String },

    #[error("no pending request for {key}")]
    UnknownRequest { key: String },

    #[error("no conversation is selected")]
    NoSelection,
}

impl ChatError {
    pub(crate) fn network(context: &'static str, err: impl fmt::Display) -> Self {
        Self::Network {
            context,
            message: err.to_string(),
        }
    }

    /// Whether dispatching the same action again can succeed without the
    /// counterparty acting first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}
