//! MQTT topic scheme for rooms.
//!
//! Topic structure: `graphsync/v1/{room}/{message_type}`
//!
//! One room is one shared position map; every replica in the room
//! subscribes to `graphsync/v1/{room}/#`.

use serde::{Deserialize, Serialize};

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Default topic prefix.
pub const DEFAULT_PREFIX: &str = "graphsync";

/// Topics of one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Room name
    pub room: String,
    /// Topic prefix (default: "graphsync")
    pub prefix: String,
}

impl TopicScheme {
    /// Create the topic scheme for a room.
    ///
    /// # Errors
    ///
    /// Returns error if the room name cannot be used as one topic level.
    pub fn new(room: impl Into<String>) -> Result<Self, TopicError> {
        let room = room.into();
        if room.is_empty() {
            return Err(TopicError::EmptyRoom);
        }
        if room.contains(['/', '+', '#', '\0']) {
            return Err(TopicError::InvalidRoom(room));
        }
        Ok(Self {
            room,
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.room)
    }

    /// Topic for hello messages.
    #[must_use]
    pub fn hello(&self) -> String {
        format!("{}/hello", self.base())
    }

    /// Topic for delta messages.
    #[must_use]
    pub fn delta(&self) -> String {
        format!("{}/delta", self.base())
    }

    /// Topic for full-state messages.
    #[must_use]
    pub fn state(&self) -> String {
        format!("{}/state", self.base())
    }

    /// Wildcard subscription for the whole room.
    #[must_use]
    pub fn room_wildcard(&self) -> String {
        format!("{}/#", self.base())
    }

    /// Message type of a topic in this room, if it is one.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<MessageType> {
        let rest = topic.strip_prefix(&self.base())?.strip_prefix('/')?;
        match rest {
            "hello" => Some(MessageType::Hello),
            "delta" => Some(MessageType::Delta),
            "state" => Some(MessageType::State),
            _ => None,
        }
    }
}

/// Message types in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Replica (re)joined
    Hello,
    /// Incremental writes
    Delta,
    /// Full state
    State,
}

/// Errors building a topic scheme.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Room name was empty
    #[error("room name is empty")]
    EmptyRoom,
    /// Room name contains topic separators or wildcards
    #[error("room name {0:?} contains '/', '+', '#' or NUL")]
    InvalidRoom(String),
}
