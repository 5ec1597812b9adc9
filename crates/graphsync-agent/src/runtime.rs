//! Session runtime.
//!
//! A single task owns the [`SyncEngine`] and consumes two typed channels:
//! edit commands from the editing surface and events from the transport.
//! Everything that touches the graph or the pending-apply set runs here.
//!
//! The task never waits on the outbound channel. When it is full, writes
//! stay coalesced in the store's outbox and go out once capacity returns.

use crate::transport::{Outbound, TransportEvent};
use graphsync_core::{
    ApplyReport, ConnectionStatus, Edge, EdgeId, GraphModel, ModelError, Node, NodeId, Position,
    SyncEngine,
};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

const EDIT_CHANNEL_CAPACITY: usize = 64;

/// A request from the editing surface.
#[derive(Debug)]
pub enum EditCommand {
    /// Create a node at a position
    AddNode {
        /// Initial position
        position: Position,
        /// Display label
        label: Option<String>,
        /// Allocated node ID
        reply: oneshot::Sender<Result<NodeId, ModelError>>,
    },
    /// Move a node
    MoveNode {
        /// Node to move
        id: NodeId,
        /// New position
        position: Position,
        /// Outcome
        reply: oneshot::Sender<Result<(), ModelError>>,
    },
    /// Connect two nodes
    Link {
        /// Source node
        source: NodeId,
        /// Target node
        target: NodeId,
        /// Allocated edge ID
        reply: oneshot::Sender<Result<EdgeId, ModelError>>,
    },
    /// Read the current graph
    View {
        /// Current view
        reply: oneshot::Sender<GraphView>,
    },
}

/// Read-only view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct GraphView {
    /// This replica
    pub replica_id: Uuid,
    /// Whether the transport is connected
    pub connected: bool,
    /// Writes waiting for a connection
    pub pending_outbound: usize,
    /// Nodes in ID order
    pub nodes: Vec<Node>,
    /// Edges in ID order
    pub edges: Vec<Edge>,
}

/// Errors returned to the editing surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// The session task has ended
    #[error("session closed")]
    Closed,
    /// The graph rejected the edit
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Cloneable handle the editing surface uses to talk to a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    edits: mpsc::Sender<EditCommand>,
}

impl SessionHandle {
    /// Create a node.
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed or the graph rejects the node.
    pub async fn add_node(
        &self,
        position: Position,
        label: Option<String>,
    ) -> Result<NodeId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(EditCommand::AddNode {
            position,
            label,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Move a node.
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed or the node is unknown.
    pub async fn move_node(&self, id: NodeId, position: Position) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(EditCommand::MoveNode {
            id,
            position,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Connect two nodes.
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed or an endpoint is unknown.
    pub async fn link(&self, source: NodeId, target: NodeId) -> Result<EdgeId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(EditCommand::Link {
            source,
            target,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Read the current graph.
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed.
    pub async fn view(&self) -> Result<GraphView, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(EditCommand::View { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn send(&self, command: EditCommand) -> Result<(), SessionError> {
        self.edits
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// One replica's sync session.
pub struct Session {
    engine: SyncEngine<GraphModel>,
    replica_id: Uuid,
    hello_due: bool,
    state_due: bool,
}

impl Session {
    /// Create a session over an existing graph.
    #[must_use]
    pub fn new(model: GraphModel, replica_id: Uuid) -> Self {
        Self {
            engine: SyncEngine::new(model, replica_id),
            replica_id,
            hello_due: false,
            state_due: false,
        }
    }

    /// Spawn the session task.
    ///
    /// The task ends when every [`SessionHandle`] is dropped and returns the
    /// stopped engine.
    pub fn spawn(
        self,
        events: mpsc::Receiver<TransportEvent>,
        outbound: mpsc::Sender<Outbound>,
    ) -> (SessionHandle, JoinHandle<SyncEngine<GraphModel>>) {
        let (edits_tx, edits_rx) = mpsc::channel(EDIT_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(edits_rx, events, outbound));
        (SessionHandle { edits: edits_tx }, task)
    }

    /// Run until the edit channel closes.
    pub async fn run(
        mut self,
        mut edits: mpsc::Receiver<EditCommand>,
        mut events: mpsc::Receiver<TransportEvent>,
        outbound: mpsc::Sender<Outbound>,
    ) -> SyncEngine<GraphModel> {
        tracing::info!(replica_id = %self.replica_id, "Session started");
        let mut transport_open = true;
        let mut outbound = Some(outbound);

        loop {
            tokio::select! {
                command = edits.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_edit(command);
                }
                event = events.recv(), if transport_open => {
                    if let Some(event) = event {
                        self.handle_transport(event);
                    } else {
                        tracing::warn!("Transport closed; continuing offline");
                        transport_open = false;
                        self.engine.on_status(ConnectionStatus::Disconnected);
                    }
                }
                ready = capacity(outbound.as_ref()), if self.has_backlog() => {
                    if !ready {
                        tracing::warn!("Transport gone; writes stay queued");
                        outbound = None;
                    }
                }
            }

            self.flush(&mut outbound);
        }

        self.engine.stop();
        self.engine
    }

    fn handle_edit(&mut self, command: EditCommand) {
        match command {
            EditCommand::AddNode {
                position,
                label,
                reply,
            } => {
                let result = self
                    .engine
                    .model_mut()
                    .transact("add node", |tx| tx.add_node(position, label));
                let _ = reply.send(result);
            }
            EditCommand::MoveNode {
                id,
                position,
                reply,
            } => {
                let result = self
                    .engine
                    .model_mut()
                    .transact("move node", |tx| tx.move_node(id, position));
                let _ = reply.send(result);
            }
            EditCommand::Link {
                source,
                target,
                reply,
            } => {
                let result = self
                    .engine
                    .model_mut()
                    .transact("link nodes", |tx| tx.add_edge(source, target));
                let _ = reply.send(result);
            }
            EditCommand::View { reply } => {
                let _ = reply.send(self.view());
            }
        }
        self.engine.process_local_commits();
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(status) => {
                let report = self.engine.on_status(status);
                log_apply(&report);
                if status == ConnectionStatus::Connected {
                    // Full state supersedes the queued writes and also covers
                    // any delta lost while the link was going down.
                    self.engine.process_local_commits();
                    let _ = self.engine.take_outbound();
                    self.hello_due = true;
                    self.state_due = true;
                }
            }
            TransportEvent::Hello(hello) => {
                tracing::info!(peer = %hello.replica_id, version = %hello.version, "Peer joined");
                self.state_due = true;
            }
            TransportEvent::Delta(message) => {
                tracing::debug!(peer = %message.sender, writes = message.delta.len(), "Received delta");
                log_apply(&self.engine.apply_remote(&message.delta));
            }
            TransportEvent::State(message) => {
                tracing::debug!(
                    peer = %message.sender,
                    entries = message.snapshot.len(),
                    "Received state"
                );
                log_apply(&self.engine.apply_remote(&message.snapshot));
            }
        }
    }

    /// Whether anything is waiting to be published.
    fn has_backlog(&self) -> bool {
        self.engine.status() == ConnectionStatus::Connected
            && (self.hello_due || self.state_due || self.engine.store().pending_outbound() > 0)
    }

    /// Publish as much of the backlog as the outbound channel accepts now.
    fn flush(&mut self, outbound: &mut Option<mpsc::Sender<Outbound>>) {
        let mut closed = false;
        if let Some(tx) = outbound.as_ref() {
            while self.has_backlog() {
                match tx.try_reserve() {
                    Ok(permit) => self.publish_next(permit),
                    Err(TrySendError::Full(())) => {
                        tracing::debug!(
                            pending_outbound = self.engine.store().pending_outbound(),
                            "Outbound channel full; holding writes"
                        );
                        break;
                    }
                    Err(TrySendError::Closed(())) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        if closed {
            tracing::warn!("Transport gone; writes stay queued");
            *outbound = None;
        }
    }

    fn publish_next(&mut self, permit: mpsc::Permit<'_, Outbound>) {
        if self.hello_due {
            self.hello_due = false;
            permit.send(Outbound::Hello);
        } else if self.state_due {
            self.state_due = false;
            let snapshot = self.engine.snapshot();
            if !snapshot.is_empty() {
                permit.send(Outbound::State(snapshot));
            }
        } else if let Some(delta) = self.engine.take_outbound() {
            permit.send(Outbound::Delta(delta));
        }
    }

    fn view(&self) -> GraphView {
        let model = self.engine.model();
        GraphView {
            replica_id: self.replica_id,
            connected: self.engine.status() == ConnectionStatus::Connected,
            pending_outbound: self.engine.store().pending_outbound(),
            nodes: model.nodes().cloned().collect(),
            edges: model.edges().cloned().collect(),
        }
    }
}

/// Resolves once the outbound channel has room, or `false` if it closed.
async fn capacity(outbound: Option<&mpsc::Sender<Outbound>>) -> bool {
    match outbound {
        Some(tx) => tx.reserve().await.is_ok(),
        None => std::future::pending().await,
    }
}

fn log_apply(report: &ApplyReport) {
    for failure in &report.failures {
        tracing::error!(
            node = %failure.id,
            error = %failure.error,
            "Remote position rejected by local graph"
        );
    }
    if !report.applied.is_empty() {
        tracing::debug!(
            applied = report.applied.len(),
            unknown = report.unknown,
            redundant = report.redundant,
            "Applied remote changes"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsync_proto::Hello;

    fn graph_with_node() -> GraphModel {
        let mut graph = GraphModel::new();
        graph
            .transact("seed", |tx| tx.insert_node(NodeId(0), Position::default(), None))
            .unwrap();
        graph
    }

    async fn next(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn connect_announces_and_publishes_state() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_handle, _task) = Session::new(graph_with_node(), Uuid::new_v4()).spawn(events_rx, out_tx);

        events_tx
            .send(TransportEvent::Status(ConnectionStatus::Connected))
            .await
            .unwrap();

        assert!(matches!(next(&mut out_rx).await, Outbound::Hello));
        match next(&mut out_rx).await {
            Outbound::State(snapshot) => assert_eq!(snapshot.len(), 1),
            other => panic!("expected state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_hello_is_answered_with_state() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_handle, _task) = Session::new(graph_with_node(), Uuid::new_v4()).spawn(events_rx, out_tx);

        events_tx
            .send(TransportEvent::Status(ConnectionStatus::Connected))
            .await
            .unwrap();
        let _ = next(&mut out_rx).await;
        let _ = next(&mut out_rx).await;

        events_tx
            .send(TransportEvent::Hello(Hello::new(Uuid::new_v4())))
            .await
            .unwrap();
        assert!(matches!(next(&mut out_rx).await, Outbound::State(_)));
    }

    #[test]
    fn edits_fail_once_the_session_is_gone() {
        let (edits, rx) = mpsc::channel(1);
        drop(rx);
        let handle = SessionHandle { edits };

        let result = tokio_test::block_on(handle.move_node(NodeId(0), Position::default()));
        assert!(matches!(result, Err(SessionError::Closed)));
    }
}
