//! Agent configuration.

use anyhow::{Context, Result};
use std::time::Duration;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Replica identifier; generated when unset
    pub replica_id: Option<Uuid>,

    /// Transport configuration
    pub transport: TransportConfig,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// MQTT broker endpoint of the sync peer
    pub endpoint: String,

    /// Room (logical session) to join
    pub room: String,

    /// MQTT keep-alive interval
    pub keep_alive: Duration,

    /// Reconnect backoff policy
    pub retry: RetryPolicy,
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub initial: Duration,

    /// Upper bound for the delay
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp://localhost:1883".to_string(),
            room: "default".to_string(),
            keep_alive: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            replica_id: None,
            transport: TransportConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GRAPHSYNC_REPLICA_ID`: Replica UUID
    /// - `GRAPHSYNC_ENDPOINT`: MQTT broker endpoint
    /// - `GRAPHSYNC_ROOM`: Room name
    /// - `GRAPHSYNC_KEEP_ALIVE_SECS`: MQTT keep-alive in seconds
    /// - `GRAPHSYNC_RETRY_INITIAL_MS`: First reconnect delay in milliseconds
    /// - `GRAPHSYNC_RETRY_MAX_MS`: Maximum reconnect delay in milliseconds
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("GRAPHSYNC_REPLICA_ID") {
            config.replica_id =
                Some(Uuid::parse_str(&id).context("Invalid GRAPHSYNC_REPLICA_ID")?);
        }

        if let Some(endpoint) = lookup("GRAPHSYNC_ENDPOINT") {
            config.transport.endpoint = endpoint;
        }

        if let Some(room) = lookup("GRAPHSYNC_ROOM") {
            config.transport.room = room;
        }

        if let Some(secs) = lookup("GRAPHSYNC_KEEP_ALIVE_SECS") {
            let secs: u64 = secs.parse().context("Invalid GRAPHSYNC_KEEP_ALIVE_SECS")?;
            config.transport.keep_alive = Duration::from_secs(secs);
        }

        if let Some(ms) = lookup("GRAPHSYNC_RETRY_INITIAL_MS") {
            let ms: u64 = ms.parse().context("Invalid GRAPHSYNC_RETRY_INITIAL_MS")?;
            config.transport.retry.initial = Duration::from_millis(ms);
        }

        if let Some(ms) = lookup("GRAPHSYNC_RETRY_MAX_MS") {
            let ms: u64 = ms.parse().context("Invalid GRAPHSYNC_RETRY_MAX_MS")?;
            config.transport.retry.max = Duration::from_millis(ms);
        }

        if config.transport.retry.max < config.transport.retry.initial {
            config.transport.retry.max = config.transport.retry.initial;
        }

        Ok(config)
    }
}
