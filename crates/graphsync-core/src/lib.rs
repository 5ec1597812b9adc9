//! # GraphSync Core
//!
//! Keeps node positions of a locally edited graph in step with a replicated
//! position map shared by every participant in a room.
//!
//! This crate provides:
//! - Hybrid Logical Clock (HLC) stamps for ordering writes across replicas
//! - Last-Writer-Wins map primitives with commutative, idempotent merge
//! - The replicated position store with an outbox and merge observers
//! - A transactional in-memory graph model
//! - The local change observer, remote change applier and the engine that
//!   coordinates them without feedback loops

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applier;
pub mod crdt;
pub mod engine;
pub mod hlc;
pub mod key;
pub mod model;
pub mod observer;
pub mod pending;
pub mod store;

pub use applier::{ApplyFailure, ApplyReport, REMOTE_APPLY_LABEL};
pub use crdt::{Delta, LwwMap, LwwRegister};
pub use engine::{ConnectionStatus, SyncEngine};
pub use hlc::{ClockError, Hlc, Timestamp, MAX_DRIFT_MS};
pub use key::{KeyError, NodeId};
pub use model::{
    CommittedTransaction, Edge, EdgeId, GraphModel, LocalModel, ModelError, Node, Position,
    PropertyChange,
};
pub use observer::ObserverReport;
pub use pending::PendingApply;
pub use store::{PositionDelta, ReplicatedStore, StoreChange};
