//! Local graph model.
//!
//! The editing surface owns a graph of nodes and edges and mutates it in
//! transactions. The sync engine only consumes the narrow [`LocalModel`]
//! capability: position lookup, a guarded position update, and the queue of
//! committed transactions. [`GraphModel`] is the in-memory implementation
//! used by the agent and in tests.

use crate::key::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// A point on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Position {
    /// Create a position.
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Whether both coordinates are finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Identifier of an edge in the local graph model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

/// A graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier
    pub id: NodeId,
    /// Canvas position
    pub position: Position,
    /// Display label (not synchronized)
    pub label: Option<String>,
}

/// A directed edge between two nodes. Edges are local-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier
    pub id: EdgeId,
    /// Source node
    pub source: NodeId,
    /// Target node
    pub target: NodeId,
}

/// The object a property change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRef {
    /// A node
    Node(NodeId),
    /// An edge
    Edge(EdgeId),
}

/// The property a change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// Node position; `Absent` on either side marks creation or removal
    Position,
    /// Node label
    Label,
    /// Edge endpoints; `Absent` on either side marks creation or removal
    Endpoints,
}

/// Value of a property before or after a change.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// The object did not exist on this side of the change
    Absent,
    /// A position
    Position(Position),
    /// A label
    Label(Option<String>),
    /// Edge endpoints
    Endpoints {
        /// Source node
        source: NodeId,
        /// Target node
        target: NodeId,
    },
}

/// One property change inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    /// Changed object
    pub object: ObjectRef,
    /// Changed property
    pub property: Property,
    /// Value before the change
    pub old: PropertyValue,
    /// Value after the change
    pub new: PropertyValue,
}

/// A finished transaction, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTransaction {
    /// Commit sequence number, starting at 1
    pub sequence: u64,
    /// Caller-supplied label
    pub label: String,
    /// Ordered property changes
    pub changes: Vec<PropertyChange>,
}

/// Capability the sync engine needs from a local graph model.
pub trait LocalModel {
    /// Current position of a node, or `None` if no such node exists.
    fn node_position(&self, id: NodeId) -> Option<Position>;

    /// Set one node's position in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the model rejects the mutation; the model is left
    /// unchanged in that case.
    fn apply_position(&mut self, id: NodeId, position: Position, label: &str)
        -> Result<(), ModelError>;

    /// Take the transactions committed since the last call, oldest first.
    fn drain_committed(&mut self) -> Vec<CommittedTransaction>;
}

/// Errors raised by graph mutations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// Node does not exist
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    /// Node already exists
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),
    /// Edge does not exist
    #[error("unknown edge {0:?}")]
    UnknownEdge(EdgeId),
    /// Position contains NaN or infinity
    #[error("non-finite position {position} for node {id}")]
    NonFinitePosition {
        /// Target node
        id: NodeId,
        /// Rejected position
        position: Position,
    },
    /// No identifiers left to allocate
    #[error("identifier space exhausted")]
    IdsExhausted,
}

/// In-memory graph model with atomic transactions.
#[derive(Debug, Default)]
pub struct GraphModel {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    next_node_id: u64,
    next_edge_id: u64,
    sequence: u64,
    committed: VecDeque<CommittedTransaction>,
}

impl GraphModel {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Iterate over nodes in ID order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Iterate over edges in ID order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Number of transactions committed so far.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.sequence
    }

    /// Run `mutator` as one atomic transaction.
    ///
    /// On success the transaction is queued for [`LocalModel::drain_committed`]
    /// unless it changed nothing. On error every change made by `mutator` is
    /// rolled back and nothing is queued.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `mutator`.
    pub fn transact<R, F>(&mut self, label: &str, mutator: F) -> Result<R, ModelError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R, ModelError>,
    {
        let nodes = self.nodes.clone();
        let edges = self.edges.clone();
        let (next_node_id, next_edge_id) = (self.next_node_id, self.next_edge_id);

        let mut tx = Transaction {
            model: &mut *self,
            changes: Vec::new(),
        };
        let result = mutator(&mut tx);
        let changes = tx.changes;

        match result {
            Ok(value) => {
                if !changes.is_empty() {
                    self.sequence += 1;
                    tracing::trace!(
                        sequence = self.sequence,
                        label,
                        changes = changes.len(),
                        "Committed transaction"
                    );
                    self.committed.push_back(CommittedTransaction {
                        sequence: self.sequence,
                        label: label.to_string(),
                        changes,
                    });
                }
                Ok(value)
            }
            Err(err) => {
                self.nodes = nodes;
                self.edges = edges;
                self.next_node_id = next_node_id;
                self.next_edge_id = next_edge_id;
                tracing::debug!(label, error = %err, "Rolled back transaction");
                Err(err)
            }
        }
    }

    /// Pick a free node ID: start at the next candidate and skip IDs in use.
    fn allocate_node_id(&mut self) -> Result<NodeId, ModelError> {
        let mut candidate = self.next_node_id;
        while self.nodes.contains_key(&NodeId(candidate)) {
            candidate = candidate.checked_add(1).ok_or(ModelError::IdsExhausted)?;
        }
        self.next_node_id = candidate.saturating_add(1);
        Ok(NodeId(candidate))
    }

    fn allocate_edge_id(&mut self) -> Result<EdgeId, ModelError> {
        let mut candidate = self.next_edge_id;
        while self.edges.contains_key(&EdgeId(candidate)) {
            candidate = candidate.checked_add(1).ok_or(ModelError::IdsExhausted)?;
        }
        self.next_edge_id = candidate.saturating_add(1);
        Ok(EdgeId(candidate))
    }
}

impl LocalModel for GraphModel {
    fn node_position(&self, id: NodeId) -> Option<Position> {
        self.nodes.get(&id).map(|n| n.position)
    }

    fn apply_position(
        &mut self,
        id: NodeId,
        position: Position,
        label: &str,
    ) -> Result<(), ModelError> {
        self.transact(label, |tx| tx.move_node(id, position))
    }

    fn drain_committed(&mut self) -> Vec<CommittedTransaction> {
        self.committed.drain(..).collect()
    }
}

/// An open transaction on a [`GraphModel`].
pub struct Transaction<'a> {
    model: &'a mut GraphModel,
    changes: Vec<PropertyChange>,
}

impl Transaction<'_> {
    /// Create a node with an allocated ID.
    ///
    /// # Errors
    ///
    /// Returns error if the position is not finite or IDs are exhausted.
    pub fn add_node(
        &mut self,
        position: Position,
        label: Option<String>,
    ) -> Result<NodeId, ModelError> {
        let id = self.model.allocate_node_id()?;
        self.insert_node(id, position, label)?;
        Ok(id)
    }

    /// Create a node with a caller-chosen ID.
    ///
    /// # Errors
    ///
    /// Returns error if the ID is taken or the position is not finite.
    pub fn insert_node(
        &mut self,
        id: NodeId,
        position: Position,
        label: Option<String>,
    ) -> Result<(), ModelError> {
        if self.model.nodes.contains_key(&id) {
            return Err(ModelError::DuplicateNode(id));
        }
        if !position.is_finite() {
            return Err(ModelError::NonFinitePosition { id, position });
        }
        self.model.nodes.insert(
            id,
            Node {
                id,
                position,
                label: label.clone(),
            },
        );
        self.record(
            ObjectRef::Node(id),
            Property::Position,
            PropertyValue::Absent,
            PropertyValue::Position(position),
        );
        if label.is_some() {
            self.record(
                ObjectRef::Node(id),
                Property::Label,
                PropertyValue::Absent,
                PropertyValue::Label(label),
            );
        }
        Ok(())
    }

    /// Move a node. Moving to the current position records nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the node is unknown or the position is not finite.
    pub fn move_node(&mut self, id: NodeId, position: Position) -> Result<(), ModelError> {
        if !position.is_finite() {
            return Err(ModelError::NonFinitePosition { id, position });
        }
        let node = self
            .model
            .nodes
            .get_mut(&id)
            .ok_or(ModelError::UnknownNode(id))?;
        let old = node.position;
        if old == position {
            return Ok(());
        }
        node.position = position;
        self.record(
            ObjectRef::Node(id),
            Property::Position,
            PropertyValue::Position(old),
            PropertyValue::Position(position),
        );
        Ok(())
    }

    /// Change a node's label.
    ///
    /// # Errors
    ///
    /// Returns error if the node is unknown.
    pub fn set_label(&mut self, id: NodeId, label: Option<String>) -> Result<(), ModelError> {
        let node = self
            .model
            .nodes
            .get_mut(&id)
            .ok_or(ModelError::UnknownNode(id))?;
        if node.label == label {
            return Ok(());
        }
        let old = std::mem::replace(&mut node.label, label.clone());
        self.record(
            ObjectRef::Node(id),
            Property::Label,
            PropertyValue::Label(old),
            PropertyValue::Label(label),
        );
        Ok(())
    }

    /// Remove a node and every edge touching it.
    ///
    /// # Errors
    ///
    /// Returns error if the node is unknown.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), ModelError> {
        let attached: Vec<EdgeId> = self
            .model
            .edges
            .values()
            .filter(|e| e.source == id || e.target == id)
            .map(|e| e.id)
            .collect();
        for edge in attached {
            self.remove_edge(edge)?;
        }
        let node = self
            .model
            .nodes
            .remove(&id)
            .ok_or(ModelError::UnknownNode(id))?;
        self.record(
            ObjectRef::Node(id),
            Property::Position,
            PropertyValue::Position(node.position),
            PropertyValue::Absent,
        );
        Ok(())
    }

    /// Connect two existing nodes.
    ///
    /// # Errors
    ///
    /// Returns error if either endpoint is unknown.
    pub fn add_edge(&mut self, source: NodeId, target: NodeId) -> Result<EdgeId, ModelError> {
        for endpoint in [source, target] {
            if !self.model.nodes.contains_key(&endpoint) {
                return Err(ModelError::UnknownNode(endpoint));
            }
        }
        let id = self.model.allocate_edge_id()?;
        self.model.edges.insert(id, Edge { id, source, target });
        self.record(
            ObjectRef::Edge(id),
            Property::Endpoints,
            PropertyValue::Absent,
            PropertyValue::Endpoints { source, target },
        );
        Ok(id)
    }

    /// Remove an edge.
    ///
    /// # Errors
    ///
    /// Returns error if the edge is unknown.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<(), ModelError> {
        let edge = self
            .model
            .edges
            .remove(&id)
            .ok_or(ModelError::UnknownEdge(id))?;
        self.record(
            ObjectRef::Edge(id),
            Property::Endpoints,
            PropertyValue::Endpoints {
                source: edge.source,
                target: edge.target,
            },
            PropertyValue::Absent,
        );
        Ok(())
    }

    /// Current position of a node, including uncommitted changes.
    #[must_use]
    pub fn position(&self, id: NodeId) -> Option<Position> {
        self.model.nodes.get(&id).map(|n| n.position)
    }

    fn record(
        &mut self,
        object: ObjectRef,
        property: Property,
        old: PropertyValue,
        new: PropertyValue,
    ) {
        self.changes.push(PropertyChange {
            object,
            property,
            old,
            new,
        });
    }
}
