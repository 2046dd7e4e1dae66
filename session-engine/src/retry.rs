//! Aggregates decryption failures that a key request could fix.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crypto::PublicKey;
use tracing::debug;

/// One outstanding key request, keyed by session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub room_id: String,
    pub session_id: String,
    pub sender_key: PublicKey,
    /// The lowest index any pending ciphertext needs. A forwarded key only
    /// has to start here.
    pub min_index: u32,
}

/// In-memory queue of [`SessionRequest`]s, drained by whoever performs the
/// network key exchange. Nothing here survives a restart.
#[derive(Debug, Default)]
pub struct RetryQueue {
    pending: Mutex<HashMap<String, SessionRequest>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, SessionRequest>> {
        // Every update leaves the map consistent.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `session_id` is needed from `index` onward. Returns true
    /// if the queue changed, i.e. the request is new or now reaches further
    /// back.
    pub fn request(
        &self,
        room_id: &str,
        session_id: &str,
        sender_key: PublicKey,
        index: u32,
    ) -> bool {
        let mut pending = self.pending();
        match pending.get_mut(session_id) {
            Some(existing) if existing.min_index <= index => false,
            Some(existing) => {
                debug!(session_id, from = existing.min_index, to = index, "lowering key request index");
                existing.min_index = index;
                true
            }
            None => {
                debug!(session_id, room_id, index, "queueing key request");
                pending.insert(
                    session_id.to_string(),
                    SessionRequest {
                        room_id: room_id.to_string(),
                        session_id: session_id.to_string(),
                        sender_key,
                        min_index: index,
                    },
                );
                true
            }
        }
    }

    /// Drop the request for `session_id` if a session starting at
    /// `first_known_index` covers it. Returns whether a request was removed.
    pub fn resolve(&self, session_id: &str, first_known_index: u32) -> bool {
        let mut pending = self.pending();
        match pending.get(session_id) {
            Some(request) if first_known_index <= request.min_index => {
                pending.remove(session_id);
                debug!(session_id, "key request satisfied");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRequest> {
        self.pending().get(session_id).cloned()
    }

    /// Every pending request, ordered by session id.
    pub fn peek(&self) -> Vec<SessionRequest> {
        let mut requests: Vec<_> = self.pending().values().cloned().collect();
        requests.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        requests
    }

    /// Remove and return every pending request, ordered by session id.
    pub fn drain(&self) -> Vec<SessionRequest> {
        let mut requests: Vec<_> = self.pending().drain().map(|(_, request)| request).collect();
        requests.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        requests
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PublicKey {
        PublicKey::from([7u8; 32])
    }

    #[test]
    fn test_request_keeps_lowest_index() {
        let queue = RetryQueue::new();
        assert!(queue.request("!r", "s1", key(), 10));
        assert!(!queue.request("!r", "s1", key(), 12));
        assert!(queue.request("!r", "s1", key(), 3));
        assert!(!queue.request("!r", "s1", key(), 3));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get("s1").unwrap().min_index, 3);
    }

    #[test]
    fn test_resolve_needs_covering_session() {
        let queue = RetryQueue::new();
        queue.request("!r", "s1", key(), 5);

        assert!(!queue.resolve("s1", 6));
        assert!(!queue.resolve("other", 0));
        assert!(queue.resolve("s1", 5));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_peek_and_drain() {
        let queue = RetryQueue::new();
        queue.request("!r", "b", key(), 1);
        queue.request("!r", "a", key(), 2);

        let peeked = queue.peek();
        assert_eq!(
            peeked.iter().map(|r| r.session_id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.drain(), peeked);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
