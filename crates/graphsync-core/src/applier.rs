//! Remote change applier.
//!
//! Applies store observation batches to the local model. Each changed key is
//! resolved to a node; unknown nodes and positions the model already holds
//! are skipped, everything else is written in its own transaction while the
//! node sits in the pending-apply set.

use crate::key::NodeId;
use crate::model::{LocalModel, ModelError};
use crate::observer::{self, ObserverReport};
use crate::pending::PendingApply;
use crate::store::{ReplicatedStore, StoreChange};

/// Transaction label used for positions written from the shared map.
pub const REMOTE_APPLY_LABEL: &str = "remote position update";

/// A remote position the local model refused.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyFailure {
    /// Target node
    pub id: NodeId,
    /// Model error
    pub error: ModelError,
}

/// Outcome of applying one observation batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Nodes whose position was updated
    pub applied: Vec<NodeId>,
    /// Keys with no matching local node
    pub unknown: usize,
    /// Keys whose value the local node already had
    pub redundant: usize,
    /// Keys that are not node keys, or remote writes the store refused
    pub malformed: usize,
    /// Mutations the local model rejected
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    /// Fold another report into this one.
    pub fn absorb(&mut self, other: ApplyReport) {
        self.applied.extend(other.applied);
        self.unknown += other.unknown;
        self.redundant += other.redundant;
        self.malformed += other.malformed;
        self.failures.extend(other.failures);
    }
}

/// Forward every queued local commit to the store.
pub fn flush_local_commits<M: LocalModel>(
    model: &mut M,
    pending: &PendingApply,
    store: &mut ReplicatedStore,
) -> ObserverReport {
    let mut report = ObserverReport::default();
    for tx in model.drain_committed() {
        let single = observer::forward_commit(&tx, pending, store);
        report.emitted.extend(single.emitted);
        report.suppressed += single.suppressed;
        report.redundant += single.redundant;
    }
    report
}

/// Apply one observation batch to the local model.
pub fn apply_change<M: LocalModel>(
    change: &StoreChange,
    store: &mut ReplicatedStore,
    model: &mut M,
    pending: &mut PendingApply,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for key in &change.changed_keys {
        let id = match NodeId::from_key(key) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Ignoring non-node key");
                report.malformed += 1;
                continue;
            }
        };
        let Some(value) = store.get(key) else {
            continue;
        };
        let Some(current) = model.node_position(id) else {
            tracing::trace!(node = %id, "No local node for remote key");
            report.unknown += 1;
            continue;
        };
        if current == value {
            report.redundant += 1;
            continue;
        }

        // Local edits committed before this point are genuine and must not be
        // mistaken for the remote write below.
        flush_local_commits(model, pending, store);

        let result = {
            let guard = pending.enter(id);
            let result = model.apply_position(id, value, REMOTE_APPLY_LABEL);
            // The commit this mutation raised is observed while the node is
            // still marked, so it is not written back.
            flush_local_commits(model, &guard, store);
            result
        };

        match result {
            Ok(()) => {
                tracing::debug!(node = %id, position = %value, "Applied remote position");
                report.applied.push(id);
            }
            Err(error) => {
                tracing::warn!(node = %id, error = %error, "Failed to apply remote position");
                report.failures.push(ApplyFailure { id, error });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphModel, Position};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn model_with(ids: &[u64]) -> GraphModel {
        let mut model = GraphModel::new();
        model
            .transact("seed", |tx| {
                for id in ids {
                    tx.insert_node(NodeId(*id), Position::default(), None)?;
                }
                Ok(())
            })
            .unwrap();
        model.drain_committed();
        model
    }

    /// A store on replica B holding writes merged from replica A.
    fn store_with(entries: &[(&str, Position)]) -> (ReplicatedStore, StoreChange) {
        let mut remote = ReplicatedStore::new(Uuid::from_bytes([1; 16]));
        for (key, value) in entries {
            remote.set(key, *value);
        }
        let mut local = ReplicatedStore::new(Uuid::from_bytes([2; 16]));
        let change = local.merge(&remote.take_outbound().unwrap());
        (local, change)
    }

    #[test]
    fn applies_and_does_not_echo() {
        let mut model = model_with(&[1]);
        let (mut store, change) = store_with(&[("1", Position::new(4.0, 2.0))]);
        let mut pending = PendingApply::new();

        let report = apply_change(&change, &mut store, &mut model, &mut pending);

        assert_eq!(report.applied, vec![NodeId(1)]);
        assert_eq!(model.node_position(NodeId(1)), Some(Position::new(4.0, 2.0)));
        assert!(store.take_outbound().is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn skips_unknown_nodes_without_error() {
        let mut model = model_with(&[1]);
        let (mut store, change) = store_with(&[("99", Position::new(1.0, 1.0))]);
        let mut pending = PendingApply::new();

        let report = apply_change(&change, &mut store, &mut model, &mut pending);

        assert_eq!(report.unknown, 1);
        assert!(report.failures.is_empty());
        assert_eq!(model.commit_count(), 1);
        assert!(model.node_position(NodeId(99)).is_none());
    }

    #[test]
    fn second_identical_apply_is_a_no_op() {
        let mut model = model_with(&[3]);
        let (mut store, change) = store_with(&[("3", Position::new(7.0, 7.0))]);
        let mut pending = PendingApply::new();

        apply_change(&change, &mut store, &mut model, &mut pending);
        let again = apply_change(&change, &mut store, &mut model, &mut pending);

        assert_eq!(again.redundant, 1);
        // Seed commit plus exactly one remote mutation.
        assert_eq!(model.commit_count(), 2);
    }

    #[test]
    fn failed_mutation_releases_pending_and_continues() {
        let mut model = model_with(&[1, 2]);
        let (mut store, change) = store_with(&[
            ("1", Position::new(f64::NAN, 0.0)),
            ("2", Position::new(5.0, 5.0)),
        ]);
        let mut pending = PendingApply::new();

        let report = apply_change(&change, &mut store, &mut model, &mut pending);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, NodeId(1));
        assert_eq!(report.applied, vec![NodeId(2)]);
        assert!(pending.is_empty());
    }

    #[test]
    fn malformed_keys_are_counted() {
        let mut model = model_with(&[1]);
        let mut store = ReplicatedStore::new(Uuid::new_v4());
        let change = StoreChange {
            changed_keys: BTreeSet::from(["node-1".to_string()]),
            rejected: 0,
        };
        let mut pending = PendingApply::new();

        let report = apply_change(&change, &mut store, &mut model, &mut pending);

        assert_eq!(report.malformed, 1);
    }

    #[test]
    fn queued_local_edit_is_not_suppressed() {
        let mut model = model_with(&[1, 2]);
        model
            .apply_position(NodeId(1), Position::new(9.0, 9.0), "user drag")
            .unwrap();
        let (mut store, change) = store_with(&[("2", Position::new(1.0, 1.0))]);
        let mut pending = PendingApply::new();

        apply_change(&change, &mut store, &mut model, &mut pending);

        assert_eq!(store.get("1"), Some(Position::new(9.0, 9.0)));
        let outbound = store.take_outbound().unwrap();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound.inserts[0].0, "1");
    }
}
