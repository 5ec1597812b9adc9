//! Last-Writer-Wins primitives backing the shared position map.
//!
//! Every key holds an [`LwwRegister`]; merging keeps the value with the
//! higher [`Timestamp`]. Merge is commutative, associative and idempotent,
//! so replicas converge regardless of delivery order or duplication.

use crate::hlc::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;

/// A Last-Writer-Wins register holding a value with its write stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    /// The stored value
    pub value: T,
    /// Timestamp of the winning write
    pub timestamp: Timestamp,
}

impl<T: Clone> LwwRegister<T> {
    /// Create a register with an initial value.
    #[must_use]
    pub fn new(value: T, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }

    /// Overwrite the value if `timestamp` is newer.
    ///
    /// Returns `true` if the register took the write.
    pub fn set(&mut self, value: T, timestamp: Timestamp) -> bool {
        if timestamp > self.timestamp {
            self.value = value;
            self.timestamp = timestamp;
            true
        } else {
            false
        }
    }

    /// Merge with another register, keeping the newer write.
    pub fn merge(&mut self, other: &Self) -> bool {
        self.set(other.value.clone(), other.timestamp)
    }
}

/// A map of independent LWW registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwMap<K, V>
where
    K: Eq + Hash,
{
    entries: HashMap<K, LwwRegister<V>>,
}

impl<K, V> Default for LwwMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LwwMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Get the current value for a key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|r| &r.value)
    }

    /// Get the register (value and stamp) for a key.
    #[must_use]
    pub fn register(&self, key: &K) -> Option<&LwwRegister<V>> {
        self.entries.get(key)
    }

    /// Write a value under `timestamp`.
    ///
    /// Returns `true` if the visible value for `key` changed.
    pub fn insert(&mut self, key: K, value: V, timestamp: Timestamp) -> bool {
        match self.entries.get_mut(&key) {
            Some(register) => {
                let changed = register.value != value;
                register.set(value, timestamp) && changed
            }
            None => {
                self.entries.insert(key, LwwRegister::new(value, timestamp));
                true
            }
        }
    }

    /// Apply a delta, returning the keys whose visible value changed.
    pub fn apply(&mut self, delta: &Delta<K, V>) -> Vec<K> {
        let mut changed = Vec::new();
        for (key, value, timestamp) in &delta.inserts {
            if self.insert(key.clone(), value.clone(), *timestamp) && !changed.contains(key) {
                changed.push(key.clone());
            }
        }
        changed
    }

    /// Full state as a delta, for anti-entropy.
    #[must_use]
    pub fn to_delta(&self) -> Delta<K, V> {
        Delta {
            inserts: self
                .entries
                .iter()
                .map(|(k, r)| (k.clone(), r.value.clone(), r.timestamp))
                .collect(),
        }
    }

    /// Iterate over keys and current values.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, r)| (k, &r.value))
    }

    /// Iterate over keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A batch of stamped writes exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta<K, V> {
    /// Written entries
    pub inserts: Vec<(K, V, Timestamp)>,
}

impl<K, V> Default for Delta<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Delta<K, V> {
    /// Create an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inserts: Vec::new(),
        }
    }

    /// Record a write.
    pub fn add_insert(&mut self, key: K, value: V, timestamp: Timestamp) {
        self.inserts.push((key, value, timestamp));
    }

    /// Whether the delta carries no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
    }

    /// Number of writes carried.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inserts.len()
    }

    /// Stamps of every carried write.
    pub fn timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.inserts.iter().map(|(_, _, ts)| *ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ts(physical: u64, counter: u32, replica: u8) -> Timestamp {
        Timestamp {
            physical_ms: physical,
            counter,
            replica_id: Uuid::from_bytes([replica; 16]),
        }
    }

    #[test]
    fn register_keeps_newer_write() {
        let mut reg = LwwRegister::new(10, ts(1000, 0, 1));

        assert!(reg.set(20, ts(2000, 0, 1)));
        assert_eq!(reg.value, 20);

        assert!(!reg.set(5, ts(1000, 0, 1)));
        assert_eq!(reg.value, 20);
    }

    #[test]
    fn insert_reports_visible_changes_only() {
        let mut map: LwwMap<String, i32> = LwwMap::new();

        assert!(map.insert("a".into(), 1, ts(1000, 0, 1)));
        // Newer stamp, same value: nothing visible changed.
        assert!(!map.insert("a".into(), 1, ts(2000, 0, 1)));
        // Older stamp loses.
        assert!(!map.insert("a".into(), 9, ts(1500, 0, 1)));
        assert!(map.insert("a".into(), 2, ts(3000, 0, 1)));

        assert_eq!(map.get(&"a".to_string()), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn concurrent_writes_converge_in_either_order() {
        let mut a: LwwMap<String, i32> = LwwMap::new();
        let mut b: LwwMap<String, i32> = LwwMap::new();

        a.insert("x".into(), 10, ts(1000, 0, 1));
        b.insert("x".into(), 20, ts(1000, 0, 2));

        let from_a = a.to_delta();
        let from_b = b.to_delta();

        a.apply(&from_b);
        b.apply(&from_a);

        assert_eq!(a.get(&"x".to_string()), Some(&20));
        assert_eq!(b.get(&"x".to_string()), Some(&20));
    }

    #[test]
    fn reapplying_a_delta_changes_nothing() {
        let mut delta: Delta<String, i32> = Delta::new();
        delta.add_insert("a".into(), 1, ts(1000, 0, 1));
        delta.add_insert("b".into(), 2, ts(1000, 1, 1));

        let mut map: LwwMap<String, i32> = LwwMap::new();
        let first = map.apply(&delta);
        let second = map.apply(&delta);

        assert_eq!(first, vec!["a".to_string(), "b".to_string()]);
        assert!(second.is_empty());
    }
}
