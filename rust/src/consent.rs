//! Consent partitioning: which canonical keys surface as active threads and
//! which as pending requests.

use std::collections::HashSet;
use std::sync::Arc;

use crate::keys::CanonicalKey;
use crate::network::{ConsentState, ConversationHandle};

/// One listed conversation as observed during a sync: the handle plus the
/// attributes that had to be read asynchronously before partitioning.
#[derive(Debug, Clone)]
pub(crate) struct Observation {
    pub handle: Arc<dyn ConversationHandle>,
    pub conversation_id: String,
    pub peer_inbox_id: Option<String>,
    pub consent: ConsentState,
}

/// The reconciled record for one handle filed under one canonical key.
/// The allowed list holds exactly one per key; the request list may repeat
/// a key when several non-allowed handles collapse onto it.
#[derive(Debug, Clone)]
pub(crate) struct ThreadRecord {
    pub key: CanonicalKey,
    pub handle: Arc<dyn ConversationHandle>,
    pub conversation_id: String,
    pub peer_inbox_id: Option<String>,
    pub consent: ConsentState,
}

fn to_record(key: &CanonicalKey, obs: &Observation) -> ThreadRecord {
    ThreadRecord {
        key: key.clone(),
        handle: obs.handle.clone(),
        conversation_id: obs.conversation_id.clone(),
        peer_inbox_id: obs.peer_inbox_id.clone(),
        consent: obs.consent,
    }
}

/// Partition key-annotated observations into (allowed, pending).
///
/// A key with at least one `Allowed` handle becomes exactly one allowed
/// record; the first `Allowed` handle encountered wins and duplicates are
/// dropped silently. Keys with no allowed handle surface every handle as a
/// pending request, one at a time for the user to resolve.
pub(crate) fn partition(
    observations: &[(CanonicalKey, Observation)],
) -> (Vec<ThreadRecord>, Vec<ThreadRecord>) {
    let mut allowed: Vec<ThreadRecord> = Vec::new();
    let mut allowed_keys: HashSet<CanonicalKey> = HashSet::new();
    for (key, obs) in observations {
        if obs.consent == ConsentState::Allowed && allowed_keys.insert(key.clone()) {
            allowed.push(to_record(key, obs));
        }
    }

    let mut pending: Vec<ThreadRecord> = Vec::new();
    for (key, obs) in observations {
        if obs.consent != ConsentState::Allowed && !allowed_keys.contains(key) {
            pending.push(to_record(key, obs));
        }
    }

    (allowed, pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetworkError, WireMessage};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct DummyHandle(String);

    #[async_trait]
    impl ConversationHandle for DummyHandle {
        fn id(&self) -> String {
            self.0.clone()
        }
        async fn peer_inbox_id(&self) -> Result<String, NetworkError> {
            Err(NetworkError::NotFound)
        }
        async fn consent_state(&self) -> Result<ConsentState, NetworkError> {
            Err(NetworkError::NotFound)
        }
        async fn set_consent_state(&self, _state: ConsentState) -> Result<(), NetworkError> {
            Ok(())
        }
        async fn list_messages(&self) -> Result<Vec<WireMessage>, NetworkError> {
            Ok(vec![])
        }
        async fn send(&self, _text: &str) -> Result<(), NetworkError> {
            Ok(())
        }
    }

    fn obs(conversation_id: &str, peer: Option<&str>, consent: ConsentState) -> (CanonicalKey, Observation) {
        let key = match peer {
            Some(p) => CanonicalKey::direct(p),
            None => CanonicalKey::fallback(conversation_id),
        };
        (
            key,
            Observation {
                handle: Arc::new(DummyHandle(conversation_id.to_string())),
                conversation_id: conversation_id.to_string(),
                peer_inbox_id: peer.map(str::to_string),
                consent,
            },
        )
    }

    #[test]
    fn any_allowed_handle_makes_the_key_allowed() {
        let observations = vec![
            obs("conv-1", Some("ib-b"), ConsentState::Unknown),
            obs("conv-2", Some("ib-b"), ConsentState::Allowed),
        ];
        let (allowed, pending) = partition(&observations);
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].conversation_id, "conv-2");
        assert!(pending.is_empty());
    }

    #[test]
    fn first_allowed_handle_wins_deterministically() {
        let observations = vec![
            obs("conv-1", Some("ib-b"), ConsentState::Allowed),
            obs("conv-2", Some("ib-b"), ConsentState::Allowed),
        ];
        let (allowed, _) = partition(&observations);
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].conversation_id, "conv-1");
    }

    #[test]
    fn keys_without_allowed_handles_surface_each_request() {
        let observations = vec![
            obs("conv-1", Some("ib-b"), ConsentState::Unknown),
            obs("conv-2", Some("ib-b"), ConsentState::Denied),
            obs("conv-3", None, ConsentState::Unknown),
        ];
        let (allowed, pending) = partition(&observations);
        assert!(allowed.is_empty());
        // Same key may repeat; requests are rare and user-resolved one at a time.
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].key, pending[1].key);
        assert_ne!(pending[0].key, pending[2].key);
    }
}
