//! Local change observer.
//!
//! Turns a committed local transaction into shared-map writes: only node
//! position changes count, only the final position per node is written, and
//! nodes in the pending-apply set are skipped because their change came from
//! the shared map in the first place.

use crate::key::NodeId;
use crate::model::{CommittedTransaction, ObjectRef, Position, Property, PropertyValue};
use crate::pending::PendingApply;
use crate::store::ReplicatedStore;

/// What one committed transaction produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverReport {
    /// Nodes written to the store, in first-touched order
    pub emitted: Vec<NodeId>,
    /// Nodes skipped because a remote apply is in flight
    pub suppressed: usize,
    /// Nodes skipped because the store already holds the position
    pub redundant: usize,
}

/// Final position of every node whose position the transaction touched.
///
/// Nodes appear in first-touched order. `None` means the node no longer
/// exists at the end of the transaction.
#[must_use]
pub fn final_positions(tx: &CommittedTransaction) -> Vec<(NodeId, Option<Position>)> {
    let mut finals: Vec<(NodeId, Option<Position>)> = Vec::new();
    for change in &tx.changes {
        let (ObjectRef::Node(id), Property::Position) = (change.object, change.property) else {
            continue;
        };
        let position = match change.new {
            PropertyValue::Position(p) => Some(p),
            _ => None,
        };
        match finals.iter_mut().find(|(seen, _)| *seen == id) {
            Some(entry) => entry.1 = position,
            None => finals.push((id, position)),
        }
    }
    finals
}

/// Forward one committed transaction to the store.
pub fn forward_commit(
    tx: &CommittedTransaction,
    pending: &PendingApply,
    store: &mut ReplicatedStore,
) -> ObserverReport {
    let mut report = ObserverReport::default();

    for (id, position) in final_positions(tx) {
        // Removed nodes keep their shared entry.
        let Some(position) = position else {
            continue;
        };
        if pending.contains(id) {
            report.suppressed += 1;
            continue;
        }
        let key = id.to_key();
        if store.get(&key) == Some(position) {
            report.redundant += 1;
            continue;
        }
        store.set(&key, position);
        report.emitted.push(id);
    }

    if !report.emitted.is_empty() || report.suppressed > 0 {
        tracing::debug!(
            sequence = tx.sequence,
            label = %tx.label,
            emitted = report.emitted.len(),
            suppressed = report.suppressed,
            redundant = report.redundant,
            "Observed local commit"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphModel, LocalModel};
    use uuid::Uuid;

    fn seeded_model(ids: &[u64]) -> GraphModel {
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

    #[test]
    fn emits_only_the_final_position() {
        let mut model = seeded_model(&[5]);
        model
            .transact("drag", |tx| {
                tx.move_node(NodeId(5), Position::new(1.0, 1.0))?;
                tx.move_node(NodeId(5), Position::new(2.0, 2.0))
            })
            .unwrap();
        let commits = model.drain_committed();
        let mut store = ReplicatedStore::new(Uuid::new_v4());

        let report = forward_commit(&commits[0], &PendingApply::new(), &mut store);

        assert_eq!(report.emitted, vec![NodeId(5)]);
        let delta = store.take_outbound().unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.inserts[0].0, "5");
        assert_eq!(delta.inserts[0].1, Position::new(2.0, 2.0));
    }

    #[test]
    fn skips_nodes_in_pending_apply() {
        let mut model = seeded_model(&[1, 2]);
        model
            .transact("both", |tx| {
                tx.move_node(NodeId(1), Position::new(1.0, 0.0))?;
                tx.move_node(NodeId(2), Position::new(2.0, 0.0))
            })
            .unwrap();
        let commits = model.drain_committed();
        let mut store = ReplicatedStore::new(Uuid::new_v4());
        let mut pending = PendingApply::new();
        let guard = pending.enter(NodeId(1));

        let report = forward_commit(&commits[0], &guard, &mut store);

        assert_eq!(report.emitted, vec![NodeId(2)]);
        assert_eq!(report.suppressed, 1);
        assert!(store.get("1").is_none());
    }

    #[test]
    fn ignores_labels_edges_and_removals() {
        let mut model = seeded_model(&[1, 2]);
        model
            .transact("decorate", |tx| {
                tx.set_label(NodeId(1), Some("hub".into()))?;
                tx.add_edge(NodeId(1), NodeId(2))?;
                tx.remove_node(NodeId(2))
            })
            .unwrap();
        let commits = model.drain_committed();
        let mut store = ReplicatedStore::new(Uuid::new_v4());

        let report = forward_commit(&commits[0], &PendingApply::new(), &mut store);

        assert!(report.emitted.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn unchanged_store_value_is_not_rewritten() {
        let mut model = seeded_model(&[4]);
        let mut store = ReplicatedStore::new(Uuid::new_v4());
        store.set("4", Position::new(3.0, 3.0));
        store.take_outbound();

        model.apply_position(NodeId(4), Position::new(3.0, 3.0), "sync").unwrap();
        let commits = model.drain_committed();

        let report = forward_commit(&commits[0], &PendingApply::new(), &mut store);

        assert_eq!(report.redundant, 1);
        assert!(store.take_outbound().is_none());
    }
}
