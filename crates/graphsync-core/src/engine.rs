//! Synchronization coordinator.
//!
//! [`SyncEngine`] owns the local model, the replicated store and the
//! pending-apply set of one session, and sequences the observer and applier
//! around them. It performs no I/O: the async runtime feeds it transport
//! status changes and inbound deltas, and drains outbound deltas from it.

use crate::applier::{self, ApplyReport};
use crate::model::LocalModel;
use crate::observer::ObserverReport;
use crate::pending::PendingApply;
use crate::store::{PositionDelta, ReplicatedStore, StoreChange};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Transport connection state as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Connected to the room
    Connected,
    /// Not connected; writes are buffered
    Disconnected,
}

/// One synchronization session between a local model and a shared room.
pub struct SyncEngine<M> {
    model: M,
    store: ReplicatedStore,
    pending: PendingApply,
    status: ConnectionStatus,
    observation: Option<mpsc::UnboundedReceiver<StoreChange>>,
    stopped: bool,
}

impl<M: LocalModel> SyncEngine<M> {
    /// Create a disconnected session.
    #[must_use]
    pub fn new(model: M, replica_id: Uuid) -> Self {
        Self {
            model,
            store: ReplicatedStore::new(replica_id),
            pending: PendingApply::new(),
            status: ConnectionStatus::Disconnected,
            observation: None,
            stopped: false,
        }
    }

    /// The local model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable access to the local model, for the editing surface.
    ///
    /// Commits made through it are picked up by the next
    /// [`SyncEngine::process_local_commits`].
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// The replicated store.
    pub fn store(&self) -> &ReplicatedStore {
        &self.store
    }

    /// Current transport status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Whether the store observer is registered.
    pub fn is_observing(&self) -> bool {
        self.observation.is_some()
    }

    /// Record a transport status transition.
    ///
    /// The first `Connected` registers the store observer and reconciles
    /// every entry already in the store against the local model.
    pub fn on_status(&mut self, status: ConnectionStatus) -> ApplyReport {
        if self.status != status {
            tracing::info!(
                replica_id = %self.store.replica_id(),
                ?status,
                pending_outbound = self.store.pending_outbound(),
                "Connection status changed"
            );
        }
        self.status = status;

        if status == ConnectionStatus::Connected && self.observation.is_none() && !self.stopped {
            self.observation = Some(self.store.observe());
            let burst = StoreChange {
                changed_keys: self.store.keys(),
                rejected: 0,
            };
            if !burst.changed_keys.is_empty() {
                tracing::debug!(entries = burst.changed_keys.len(), "Reconciling existing entries");
                return self.apply(&burst);
            }
        }
        ApplyReport::default()
    }

    /// Forward queued local commits to the store.
    pub fn process_local_commits(&mut self) -> ObserverReport {
        if self.stopped {
            return ObserverReport::default();
        }
        applier::flush_local_commits(&mut self.model, &self.pending, &mut self.store)
    }

    /// Merge a delta from another replica and apply what changed.
    pub fn apply_remote(&mut self, delta: &PositionDelta) -> ApplyReport {
        self.process_local_commits();
        let merged = self.store.merge(delta);

        let mut report = ApplyReport {
            malformed: merged.rejected,
            ..ApplyReport::default()
        };
        let mut batches = Vec::new();
        if let Some(observation) = self.observation.as_mut() {
            while let Ok(change) = observation.try_recv() {
                batches.push(change);
            }
        }
        for change in &batches {
            report.absorb(self.apply(change));
        }
        report
    }

    /// Queued local writes, if connected.
    ///
    /// While disconnected writes stay queued and are returned by the first
    /// call after reconnecting.
    pub fn take_outbound(&mut self) -> Option<PositionDelta> {
        if self.status != ConnectionStatus::Connected {
            return None;
        }
        self.store.take_outbound()
    }

    /// Full store state, for anti-entropy.
    pub fn snapshot(&self) -> PositionDelta {
        self.store.snapshot()
    }

    /// Deregister the store observer and stop forwarding commits.
    ///
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.observation = None;
        tracing::info!(replica_id = %self.store.replica_id(), "Sync session stopped");
    }

    /// Whether [`SyncEngine::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn apply(&mut self, change: &StoreChange) -> ApplyReport {
        applier::apply_change(change, &mut self.store, &mut self.model, &mut self.pending)
    }
}
