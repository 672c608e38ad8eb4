//! In-flight consume requests
//!
//! Tracks (connection, producer) pairs whose consume is still being
//! processed, so a second request for the same pair on the same connection
//! is recognised as a duplicate instead of racing the first.

use dashmap::DashMap;
use huddle_proto::{PeerId, ProducerId};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct PendingConsumes {
    inner: Arc<DashMap<PeerId, HashSet<ProducerId>>>,
}

/// Removes its pair from the pending set when dropped
pub struct PendingGuard {
    inner: Arc<DashMap<PeerId, HashSet<ProducerId>>>,
    connection: PeerId,
    producer: ProducerId,
}

impl PendingConsumes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a pair as in flight. Returns `None` if it already is.
    #[must_use]
    pub fn try_begin(&self, connection: &PeerId, producer: &ProducerId) -> Option<PendingGuard> {
        let inserted = self
            .inner
            .entry(connection.clone())
            .or_default()
            .insert(producer.clone());
        inserted.then(|| PendingGuard {
            inner: Arc::clone(&self.inner),
            connection: connection.clone(),
            producer: producer.clone(),
        })
    }

    #[must_use]
    pub fn is_pending(&self, connection: &PeerId, producer: &ProducerId) -> bool {
        self.inner
            .get(connection)
            .is_some_and(|set| set.contains(producer))
    }

    /// Forget every pair of a connection
    pub fn clear_connection(&self, connection: &PeerId) {
        self.inner.remove(connection);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.iter().map(|entry| entry.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.remove_if_mut(&self.connection, |_, set| {
            set.remove(&self.producer);
            set.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_is_rejected_until_guard_drops() {
        let pending = PendingConsumes::new();
        let conn = PeerId::from("c1");
        let producer = ProducerId::from("p1");

        let guard = pending.try_begin(&conn, &producer).unwrap();
        assert!(pending.try_begin(&conn, &producer).is_none());
        assert!(pending.is_pending(&conn, &producer));

        drop(guard);
        assert!(!pending.is_pending(&conn, &producer));
        assert!(pending.is_empty());
        assert!(pending.try_begin(&conn, &producer).is_some());
    }

    #[test]
    fn test_pairs_are_per_connection() {
        let pending = PendingConsumes::new();
        let producer = ProducerId::from("p1");

        let _a = pending.try_begin(&PeerId::from("c1"), &producer).unwrap();
        let _b = pending.try_begin(&PeerId::from("c2"), &producer).unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_clear_connection() {
        let pending = PendingConsumes::new();
        let conn = PeerId::from("c1");

        let guard = pending.try_begin(&conn, &ProducerId::from("p1")).unwrap();
        pending.clear_connection(&conn);
        assert!(pending.is_empty());

        // A late guard drop after clearing is harmless
        drop(guard);
        assert!(pending.is_empty());
    }
}
