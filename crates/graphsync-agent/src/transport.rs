//! MQTT transport session for a room.
//!
//! The MQTT event loop runs in its own task and only forwards typed
//! [`TransportEvent`]s; publishing is fed by an [`Outbound`] channel. Neither
//! task touches session state.

use crate::config::{RetryPolicy, TransportConfig};
use graphsync_core::{ConnectionStatus, PositionDelta};
use graphsync_proto::{
    DeltaMessage, Hello, MessageType, StateMessage, TopicError, TopicScheme, WireMessage,
};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

const DEFAULT_PORT: u16 = 1883;
const CHANNEL_CAPACITY: usize = 100;

/// Something the transport observed.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection state changed
    Status(ConnectionStatus),
    /// A peer joined the room
    Hello(Hello),
    /// A peer wrote positions
    Delta(DeltaMessage),
    /// A peer shared its full state
    State(StateMessage),
}

/// Something the session wants published.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Announce this replica
    Hello,
    /// Incremental writes
    Delta(PositionDelta),
    /// Full state
    State(PositionDelta),
}

/// Channels connecting a session to its transport.
pub struct TransportChannels {
    /// Inbound events
    pub events: mpsc::Receiver<TransportEvent>,
    /// Outbound publications
    pub outbound: mpsc::Sender<Outbound>,
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    next: Duration,
}

impl Backoff {
    /// Start at the policy's initial delay.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            next: policy.initial,
        }
    }

    /// Delay before the next attempt; doubles up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.policy.max);
        delay
    }

    /// Back to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.next = self.policy.initial;
    }
}

/// MQTT-backed transport.
pub struct MqttTransport;

impl MqttTransport {
    /// Connect to the room and start the transport tasks.
    ///
    /// Returns immediately; the connection is established in the background
    /// and reported as [`TransportEvent::Status`].
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint or room name is invalid.
    pub fn connect(
        config: &TransportConfig,
        replica_id: Uuid,
    ) -> Result<TransportChannels, TransportError> {
        let (host, port) = parse_endpoint(&config.endpoint)?;
        let scheme = TopicScheme::new(config.room.clone())?;

        let mut mqtt_options = MqttOptions::new(format!("graphsync-{replica_id}"), host, port);
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(mqtt_options, CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tracing::info!(
            endpoint = %config.endpoint,
            room = %scheme.room,
            %replica_id,
            "Connecting transport"
        );

        tokio::spawn(poll_loop(
            eventloop,
            client.clone(),
            scheme.clone(),
            replica_id,
            Backoff::new(config.retry),
            event_tx,
        ));
        tokio::spawn(publish_loop(client, scheme, replica_id, outbound_rx));

        Ok(TransportChannels {
            events: event_rx,
            outbound: outbound_tx,
        })
    }
}

async fn poll_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    scheme: TopicScheme,
    replica_id: Uuid,
    mut backoff: Backoff,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut connected = false;
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                // Clean sessions drop subscriptions on reconnect.
                if let Err(err) = client.try_subscribe(scheme.room_wildcard(), QoS::AtLeastOnce) {
                    tracing::error!(error = %err, "Failed to queue room subscription");
                }
                connected = true;
                tracing::info!(room = %scheme.room, "Connected to MQTT broker");
                Some(TransportEvent::Status(ConnectionStatus::Connected))
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(
                    topic = %publish.topic,
                    payload_len = publish.payload.len(),
                    "Received room message"
                );
                decode_event(&scheme, replica_id, &publish.topic, &publish.payload)
            }
            Ok(_) => None,
            Err(err) => {
                let delay = backoff.next_delay();
                tracing::warn!(error = %err, retry_in = ?delay, "MQTT connection error");
                let was_connected = std::mem::replace(&mut connected, false);
                if was_connected
                    && events
                        .send(TransportEvent::Status(ConnectionStatus::Disconnected))
                        .await
                        .is_err()
                {
                    break;
                }
                tokio::time::sleep(delay).await;
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                tracing::debug!("Session dropped, stopping transport");
                break;
            }
        }
    }
}

async fn publish_loop(
    client: AsyncClient,
    scheme: TopicScheme,
    replica_id: Uuid,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(message) = outbound.recv().await {
        let (topic, payload) = match encode_outbound(&scheme, replica_id, message) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to encode outbound message");
                continue;
            }
        };
        tracing::debug!(topic, payload_len = payload.len(), "Publishing");
        if let Err(err) = client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            tracing::warn!(error = %err, topic, "Failed to publish");
        }
    }
    if let Err(err) = client.disconnect().await {
        tracing::debug!(error = %err, "Disconnect after session end failed");
    }
}

/// Topic and CBOR payload for an outbound message.
///
/// # Errors
///
/// Returns error if the message cannot be serialized.
pub fn encode_outbound(
    scheme: &TopicScheme,
    replica_id: Uuid,
    message: Outbound,
) -> Result<(String, Vec<u8>), TransportError> {
    let encoded = match message {
        Outbound::Hello => (scheme.hello(), Hello::new(replica_id).to_cbor()),
        Outbound::Delta(delta) => (
            scheme.delta(),
            DeltaMessage::new(replica_id, delta).to_cbor(),
        ),
        Outbound::State(snapshot) => (
            scheme.state(),
            StateMessage::new(replica_id, snapshot).to_cbor(),
        ),
    };
    let (topic, payload) = encoded;
    Ok((topic, payload.map_err(|e| TransportError::Encode(e.to_string()))?))
}

/// Decode a room message, dropping our own echoes and anything malformed.
#[must_use]
pub fn decode_event(
    scheme: &TopicScheme,
    replica_id: Uuid,
    topic: &str,
    payload: &[u8],
) -> Option<TransportEvent> {
    let msg_type = scheme.parse(topic)?;
    let decoded = match msg_type {
        MessageType::Hello => Hello::from_cbor(payload).map(TransportEvent::Hello),
        MessageType::Delta => DeltaMessage::from_cbor(payload).map(TransportEvent::Delta),
        MessageType::State => StateMessage::from_cbor(payload).map(TransportEvent::State),
    };
    let event = match decoded {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, topic, "Failed to decode room message");
            return None;
        }
    };

    let sender = match &event {
        TransportEvent::Hello(m) => m.sender(),
        TransportEvent::Delta(m) => m.sender(),
        TransportEvent::State(m) => m.sender(),
        TransportEvent::Status(_) => return Some(event),
    };
    if sender == replica_id {
        return None;
    }
    Some(event)
}

/// Parse a broker endpoint into host and port.
fn parse_endpoint(input: &str) -> Result<(String, u16), TransportError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::InvalidEndpoint(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => DEFAULT_PORT,
        Some(port) => port.parse().map_err(|_| {
            TransportError::InvalidEndpoint(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(TransportError::InvalidEndpoint(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors for transport setup and encoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Invalid broker endpoint
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// Invalid room
    #[error(transparent)]
    Room(#[from] TopicError),
    /// Message encoding failed
    #[error("encode error: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsync_core::{Position, ReplicatedStore};

    #[test]
    fn parse_endpoint_tcp() {
        let (host, port) = parse_endpoint("tcp://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_endpoint_default_port() {
        let (host, port) = parse_endpoint("mqtt://broker.example.com").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_endpoint_no_scheme() {
        let (host, port) = parse_endpoint("peer.local:1884").unwrap();
        assert_eq!(host, "peer.local");
        assert_eq!(port, 1884);
    }

    #[test]
    fn parse_endpoint_rejects_bad_input() {
        assert!(parse_endpoint("ws://localhost:80").is_err());
        assert!(parse_endpoint(":1883").is_err());
        assert!(parse_endpoint("host:port").is_err());
        assert!(parse_endpoint("a:1:2").is_err());
    }

    #[test]
    fn backoff_doubles_until_capped_and_resets() {
        let mut backoff = Backoff::new(RetryPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn decode_drops_own_echo() {
        let scheme = TopicScheme::new("room").unwrap();
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut store = ReplicatedStore::new(peer);
        store.set("1", Position::new(1.0, 1.0));
        let delta = store.take_outbound().unwrap();

        let (topic, mine) = encode_outbound(&scheme, me, Outbound::Delta(delta.clone())).unwrap();
        let (_, theirs) = encode_outbound(&scheme, peer, Outbound::Delta(delta)).unwrap();

        assert!(decode_event(&scheme, me, &topic, &mine).is_none());
        assert!(matches!(
            decode_event(&scheme, me, &topic, &theirs),
            Some(TransportEvent::Delta(m)) if m.sender == peer
        ));
    }

    #[test]
    fn decode_ignores_foreign_topics_and_garbage() {
        let scheme = TopicScheme::new("room").unwrap();
        let me = Uuid::new_v4();

        let (_, hello) = encode_outbound(&scheme, Uuid::new_v4(), Outbound::Hello).unwrap();
        assert!(decode_event(&scheme, me, "graphsync/v1/other/hello", &hello).is_none());
        assert!(decode_event(&scheme, me, &scheme.delta(), b"not cbor").is_none());
        assert!(matches!(
            decode_event(&scheme, me, &scheme.hello(), &hello),
            Some(TransportEvent::Hello(_))
        ));
    }
}
