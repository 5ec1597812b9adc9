//! Replicated store of node positions.
//!
//! A single shared map from node key to [`Position`], backed by an
//! [`LwwMap`] stamped by the replica's [`Hlc`]. Local writes go to an outbox
//! that the coordinator flushes over the transport; remote deltas are merged
//! and reported to observers as one [`StoreChange`] per batch.
//!
//! Local writes never notify local observers: only merges do.

use crate::crdt::{Delta, LwwMap};
use crate::hlc::{Hlc, Timestamp};
use crate::model::Position;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A batch of stamped position writes.
pub type PositionDelta = Delta<String, Position>;

/// Keys whose visible value changed in one merge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreChange {
    /// Changed keys, sorted
    pub changed_keys: BTreeSet<String>,
    /// Remote writes refused: non-finite positions or stamps beyond the
    /// clock's drift bound
    pub rejected: usize,
}

/// The shared position map held by one replica.
#[derive(Debug)]
pub struct ReplicatedStore {
    map: LwwMap<String, Position>,
    clock: Hlc,
    outbox: BTreeMap<String, (Position, Timestamp)>,
    observers: Vec<mpsc::UnboundedSender<StoreChange>>,
}

impl ReplicatedStore {
    /// Create an empty store for the given replica.
    #[must_use]
    pub fn new(replica_id: Uuid) -> Self {
        Self {
            map: LwwMap::new(),
            clock: Hlc::new(replica_id),
            outbox: BTreeMap::new(),
            observers: Vec::new(),
        }
    }

    /// The replica this store writes as.
    #[must_use]
    pub fn replica_id(&self) -> Uuid {
        self.clock.replica_id()
    }

    /// Current value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Position> {
        self.map.get(&key.to_string()).copied()
    }

    /// Write a value locally and queue it for replication.
    ///
    /// Local observers are not notified.
    pub fn set(&mut self, key: &str, value: Position) -> Timestamp {
        let timestamp = self.clock.tick();
        self.map.insert(key.to_string(), value, timestamp);
        // Only the newest write per key is worth sending.
        self.outbox.insert(key.to_string(), (value, timestamp));
        tracing::debug!(
            key,
            %value,
            timestamp = ?timestamp,
            "Queued local write"
        );
        timestamp
    }

    /// Register an observer. Dropping the receiver deregisters it.
    pub fn observe(&mut self) -> mpsc::UnboundedReceiver<StoreChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    /// Merge a delta received from another replica.
    ///
    /// Returns the keys whose visible value changed; observers receive the
    /// same batch if it is non-empty. Writes carrying a non-finite position
    /// or a stamp too far in the future are dropped and counted.
    pub fn merge(&mut self, delta: &PositionDelta) -> StoreChange {
        let mut accepted = PositionDelta::new();
        let mut rejected = 0;
        for (key, value, timestamp) in &delta.inserts {
            if !value.is_finite() {
                tracing::warn!(key = %key, position = %value, "Rejected non-finite remote position");
                rejected += 1;
                continue;
            }
            if let Err(err) = self.clock.observe(*timestamp) {
                tracing::warn!(key = %key, error = %err, "Rejected remote write");
                rejected += 1;
                continue;
            }
            accepted.add_insert(key.clone(), *value, *timestamp);
        }

        let changed_keys: BTreeSet<String> = self.map.apply(&accepted).into_iter().collect();

        // Queued writes that lost to a newer remote write would be rejected
        // by every peer anyway.
        let map = &self.map;
        self.outbox.retain(|key, (_, timestamp)| {
            map.register(key)
                .map_or(true, |register| register.timestamp <= *timestamp)
        });

        let change = StoreChange {
            changed_keys,
            rejected,
        };
        tracing::debug!(
            inserts = delta.len(),
            rejected,
            changed = change.changed_keys.len(),
            entries = self.map.len(),
            "Merged remote delta"
        );

        if !change.changed_keys.is_empty() {
            self.observers
                .retain(|observer| observer.send(change.clone()).is_ok());
        }
        change
    }

    /// Take every queued local write as one delta.
    pub fn take_outbound(&mut self) -> Option<PositionDelta> {
        if self.outbox.is_empty() {
            return None;
        }
        let mut delta = Delta::new();
        for (key, (value, timestamp)) in std::mem::take(&mut self.outbox) {
            delta.add_insert(key, value, timestamp);
        }
        Some(delta)
    }

    /// Number of keys waiting to be flushed.
    #[must_use]
    pub fn pending_outbound(&self) -> usize {
        self.outbox.len()
    }

    /// Full state as a delta, for anti-entropy.
    #[must_use]
    pub fn snapshot(&self) -> PositionDelta {
        self.map.to_delta()
    }

    /// Every key currently present.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<String> {
        self.map.keys().cloned().collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn local_set_does_not_notify_local_observer() {
        let mut store = ReplicatedStore::new(replica(1));
        let mut rx = store.observe();

        store.set("1", Position::new(1.0, 2.0));

        assert_eq!(store.get("1"), Some(Position::new(1.0, 2.0)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn merge_notifies_other_replica_once_per_batch() {
        let mut a = ReplicatedStore::new(replica(1));
        let mut b = ReplicatedStore::new(replica(2));
        let mut rx = b.observe();

        a.set("1", Position::new(1.0, 1.0));
        a.set("2", Position::new(2.0, 2.0));
        let delta = a.take_outbound().unwrap();

        let change = b.merge(&delta);

        let expected: BTreeSet<String> = ["1".to_string(), "2".to_string()].into();
        assert_eq!(change.changed_keys, expected);
        assert_eq!(rx.try_recv().unwrap().changed_keys, expected);
        assert!(rx.try_recv().is_err());

        // Duplicate delivery is silent.
        assert!(b.merge(&delta).changed_keys.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn observer_can_await_changes() {
        let mut a = ReplicatedStore::new(replica(1));
        let mut b = ReplicatedStore::new(replica(2));
        let mut rx = b.observe();

        a.set("3", Position::new(3.0, 4.0));
        b.merge(&a.take_outbound().unwrap());

        let change = tokio_test::block_on(rx.recv()).unwrap();
        assert!(change.changed_keys.contains("3"));
    }

    #[test]
    fn outbox_coalesces_per_key() {
        let mut store = ReplicatedStore::new(replica(1));

        store.set("5", Position::new(0.0, 0.0));
        store.set("5", Position::new(1.0, 1.0));
        store.set("6", Position::new(3.0, 3.0));

        assert_eq!(store.pending_outbound(), 2);
        let delta = store.take_outbound().unwrap();
        assert_eq!(delta.len(), 2);
        assert!(delta
            .inserts
            .iter()
            .any(|(k, v, _)| k == "5" && *v == Position::new(1.0, 1.0)));
        assert!(store.take_outbound().is_none());
    }

    #[test]
    fn concurrent_writes_pick_the_same_winner() {
        let mut a = ReplicatedStore::new(replica(1));
        let mut b = ReplicatedStore::new(replica(2));

        a.set("1", Position::new(10.0, 0.0));
        b.set("1", Position::new(20.0, 0.0));

        let from_a = a.take_outbound().unwrap();
        let from_b = b.take_outbound().unwrap();
        a.merge(&from_b);
        b.merge(&from_a);

        assert_eq!(a.get("1"), b.get("1"));
    }

    #[test]
    fn losing_local_write_is_dropped_from_outbox() {
        let mut a = ReplicatedStore::new(replica(1));
        let mut b = ReplicatedStore::new(replica(2));

        a.set("1", Position::new(1.0, 0.0));
        // b writes after observing a's clock, so b's stamp is newer.
        let from_a = a.snapshot();
        b.merge(&from_a);
        b.set("1", Position::new(2.0, 0.0));
        let from_b = b.take_outbound().unwrap();

        a.merge(&from_b);

        assert_eq!(a.get("1"), Some(Position::new(2.0, 0.0)));
        assert_eq!(a.pending_outbound(), 0);
    }

    #[test]
    fn merge_refuses_non_finite_positions() {
        let mut store = ReplicatedStore::new(replica(1));
        let mut sender = ReplicatedStore::new(replica(2));
        sender.set("1", Position::new(5.0, 5.0));
        let mut delta = sender.take_outbound().unwrap();
        let stamp = delta.inserts[0].2;
        delta.add_insert("2".to_string(), Position::new(f64::NAN, 0.0), stamp);
        delta.add_insert("3".to_string(), Position::new(0.0, f64::INFINITY), stamp);

        let change = store.merge(&delta);

        assert_eq!(change.rejected, 2);
        assert_eq!(change.changed_keys, BTreeSet::from(["1".to_string()]));
        assert_eq!(store.get("2"), None);
        assert_eq!(store.get("3"), None);
    }

    #[test]
    fn merge_refuses_stamps_far_in_the_future() {
        let mut store = ReplicatedStore::new(replica(1));
        let mut delta = PositionDelta::new();
        delta.add_insert(
            "1".to_string(),
            Position::new(9.0, 9.0),
            Timestamp {
                physical_ms: u64::MAX,
                counter: u32::MAX,
                replica_id: replica(2),
            },
        );

        let change = store.merge(&delta);
        assert_eq!(change.rejected, 1);
        assert_eq!(store.get("1"), None);

        // Later local writes are still stamped from a sane clock.
        let stamp = store.set("1", Position::new(1.0, 1.0));
        assert!(stamp.physical_ms < u64::MAX);
        assert_eq!(store.get("1"), Some(Position::new(1.0, 1.0)));
    }

    #[test]
    fn dropped_observers_are_pruned() {
        let mut a = ReplicatedStore::new(replica(1));
        let mut b = ReplicatedStore::new(replica(2));
        drop(b.observe());

        a.set("1", Position::new(1.0, 1.0));
        b.merge(&a.take_outbound().unwrap());

        assert!(b.observers.is_empty());
    }
}
