//! # GraphSync Agent
//!
//! Joins a room over MQTT and keeps an in-memory graph's node positions in
//! step with every other replica in the room.
//!
//! ## Architecture
//!
//! Three tasks, connected by channels:
//! 1. **Poller**: drives the MQTT event loop, reconnects with backoff, and
//!    forwards typed transport events
//! 2. **Publisher**: encodes outbound deltas and state and publishes them
//! 3. **Session**: owns the sync engine and graph; consumes edit commands and
//!    transport events on a single task

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod runtime;
pub mod transport;

pub use config::{AgentConfig, RetryPolicy, TransportConfig};
pub use runtime::{EditCommand, GraphView, Session, SessionError, SessionHandle};
pub use transport::{MqttTransport, Outbound, TransportChannels, TransportEvent};
