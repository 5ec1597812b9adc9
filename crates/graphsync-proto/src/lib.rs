//! # GraphSync Protocol
//!
//! Room messages and MQTT topic scheme for position replication.
//!
//! ## Messages
//!
//! - `Hello`: a replica joined; peers answer with their state
//! - `DeltaMessage`: incremental position writes
//! - `StateMessage`: full position map, for anti-entropy
//!
//! ## MQTT Topics
//!
//! Topic scheme: `graphsync/v1/{room}/{message_type}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{DeltaMessage, Hello, MessageError, StateMessage, WireMessage};
pub use topics::{MessageType, TopicError, TopicScheme};
