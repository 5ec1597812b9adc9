//! Room messages exchanged between replicas.

use graphsync_core::PositionDelta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CBOR encoding shared by every room message.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Replica that sent the message.
    fn sender(&self) -> Uuid;

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Announces a replica joining or rejoining the room.
///
/// Peers answer with a [`StateMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Announcing replica
    pub replica_id: Uuid,
    /// Agent version
    pub version: String,
}

impl Hello {
    /// Create a hello for this replica.
    #[must_use]
    pub fn new(replica_id: Uuid) -> Self {
        Self {
            replica_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl WireMessage for Hello {
    fn sender(&self) -> Uuid {
        self.replica_id
    }
}

/// Incremental position writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaMessage {
    /// Writing replica
    pub sender: Uuid,
    /// Stamped writes
    pub delta: PositionDelta,
}

impl DeltaMessage {
    /// Wrap a delta.
    #[must_use]
    pub fn new(sender: Uuid, delta: PositionDelta) -> Self {
        Self { sender, delta }
    }
}

impl WireMessage for DeltaMessage {
    fn sender(&self) -> Uuid {
        self.sender
    }
}

/// A replica's full position map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    /// Replica whose state this is
    pub sender: Uuid,
    /// Every entry with its stamp
    pub snapshot: PositionDelta,
}

impl StateMessage {
    /// Wrap a snapshot.
    #[must_use]
    pub fn new(sender: Uuid, snapshot: PositionDelta) -> Self {
        Self { sender, snapshot }
    }
}

impl WireMessage for StateMessage {
    fn sender(&self) -> Uuid {
        self.sender
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsync_core::{Position, ReplicatedStore};

    #[test]
    fn delta_message_survives_cbor() {
        let sender = Uuid::new_v4();
        let mut store = ReplicatedStore::new(sender);
        store.set("5", Position::new(2.0, 2.0));
        let message = DeltaMessage::new(sender, store.take_outbound().unwrap());

        let decoded = DeltaMessage::from_cbor(&message.to_cbor().unwrap()).unwrap();

        assert_eq!(decoded.sender(), sender);
        assert_eq!(decoded.delta, message.delta);
    }

    #[test]
    fn garbage_is_a_deserialize_error() {
        let err = StateMessage::from_cbor(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, MessageError::Deserialize(_)));
    }

    #[test]
    fn hello_carries_version() {
        let hello = Hello::new(Uuid::new_v4());
        let decoded = Hello::from_cbor(&hello.to_cbor().unwrap()).unwrap();
        assert_eq!(decoded.replica_id, hello.replica_id);
        assert_eq!(decoded.version, env!("CARGO_PKG_VERSION"));
    }
}
