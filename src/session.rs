use crate::config::{EndpointConfig, TransportKind};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, DisconnectReasonCode, Filter, Packet, Publish, PublishProperties,
    RetainForwardRule,
};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use rumqttc::Transport;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Which broker a session (or an event) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Remote,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Source => Side::Remote,
            Side::Remote => Side::Source,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// One in-flight MQTT message, carried verbatim between the two sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Option<PublishProperties>,
}

#[derive(Debug, Error)]
#[error("publish carries a non-UTF-8 topic ({topic_len} bytes)")]
pub struct MalformedMessage {
    topic_len: usize,
}

impl TryFrom<Publish> for Message {
    type Error = MalformedMessage;

    fn try_from(publish: Publish) -> Result<Self, Self::Error> {
        let topic = String::from_utf8(publish.topic.to_vec()).map_err(|_| MalformedMessage {
            topic_len: publish.topic.len(),
        })?;

        Ok(Self {
            topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            properties: publish.properties,
        })
    }
}

/// Notification emitted by a session towards the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    /// Reason code when the broker sent a DISCONNECT packet, `None` when the
    /// transport dropped without one.
    Disconnected(Option<DisconnectReasonCode>),
    Message(Message),
}

pub type SessionEventSender = mpsc::Sender<(Side, SessionEvent)>;
pub type SessionEventReceiver = mpsc::Receiver<(Side, SessionEvent)>;

/// Subscribe options applied identically to every topic on every (re)connect.
#[derive(Debug, Clone)]
pub struct SubscriptionPolicy {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainForwardRule,
}

impl SubscriptionPolicy {
    /// The bridge policy: QoS 0, suppress own publishes coming back, and
    /// resend retained messages on every (re)subscribe.
    pub const fn mirror() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            no_local: true,
            retain_as_published: false,
            retain_handling: RetainForwardRule::OnEverySubscribe,
        }
    }

    pub fn filters<'a, I>(&self, topics: I) -> Vec<Filter>
    where
        I: IntoIterator<Item = &'a String>,
    {
        topics
            .into_iter()
            .map(|topic| Filter {
                path: topic.clone(),
                qos: self.qos,
                nolocal: self.no_local,
                preserve_retain: self.retain_as_published,
                retain_forward_rule: self.retain_handling.clone(),
            })
            .collect()
    }
}

/// A publish on the peer's connection failed. The request queue only closes
/// when the session's own loop is gone, so this is always fatal; transient
/// transport faults never surface here - they hit the session's event loop
/// and are recovered by its reconnect policy.
#[derive(Debug, Error)]
#[error("publish on {side} session failed: {reason}")]
pub struct PublishError {
    pub side: Side,
    pub reason: String,
}

/// The cross-session publish seam. The bridge only ever talks to a session
/// through this trait.
#[async_trait]
pub trait MessageSink: Send + Sync {
    fn side(&self) -> Side;

    async fn publish(&self, message: Message) -> Result<(), PublishError>;
}

/// Cloneable publish handle for one session. Safe to call from the peer
/// session's task; rumqttc serializes outbound requests internally.
#[derive(Clone)]
pub struct SessionHandle {
    side: Side,
    client: AsyncClient,
}

#[async_trait]
impl MessageSink for SessionHandle {
    fn side(&self) -> Side {
        self.side
    }

    async fn publish(&self, message: Message) -> Result<(), PublishError> {
        let Message {
            topic,
            payload,
            qos,
            retain,
            properties,
        } = message;

        let result = match properties {
            Some(properties) => {
                self.client
                    .publish_with_properties(topic, qos, retain, payload, properties)
                    .await
            }
            None => self.client.publish(topic, qos, retain, payload).await,
        };

        result.map_err(|err| PublishError {
            side: self.side,
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the connection loop must do in response to one incoming packet.
#[derive(Debug, PartialEq)]
enum PacketAction {
    /// Re-issue the full subscription, then report Connected.
    Resubscribe,
    Emit(SessionEvent),
    Ignore,
}

/// Dispatch one incoming packet: update the session state and decide what
/// the loop does next. Free of I/O so it can be exercised without a broker.
fn on_incoming(side: Side, state: &mut SessionState, packet: Packet) -> Result<PacketAction> {
    match packet {
        Packet::ConnAck(ack) => {
            if ack.code == ConnectReturnCode::Success {
                *state = SessionState::Connected;
                Ok(PacketAction::Resubscribe)
            } else {
                error!(
                    "{} broker rejected connection with reason code {:?}",
                    side, ack.code
                );
                *state = SessionState::Disconnected;
                Ok(PacketAction::Ignore)
            }
        }
        Packet::Publish(publish) => {
            let message = Message::try_from(publish)
                .with_context(|| format!("{} session received an unforwardable publish", side))?;
            debug!(
                "{} session received '{}' ({} bytes)",
                side,
                message.topic,
                message.payload.len()
            );
            Ok(PacketAction::Emit(SessionEvent::Message(message)))
        }
        Packet::Disconnect(disconnect) => {
            if disconnect.reason_code != DisconnectReasonCode::NormalDisconnection {
                error!(
                    "{} broker disconnected with reason code {:?}",
                    side, disconnect.reason_code
                );
            }
            *state = SessionState::Disconnected;
            Ok(PacketAction::Emit(SessionEvent::Disconnected(Some(
                disconnect.reason_code,
            ))))
        }
        _ => Ok(PacketAction::Ignore),
    }
}

/// (Re-)issue the subscription for every configured topic. Runs on each
/// successful CONNACK, never on demand from the bridge. A failed subscribe
/// is logged and retried on the next reconnect.
async fn subscribe_all(
    client: &AsyncClient,
    side: Side,
    topics: &[String],
    policy: &SubscriptionPolicy,
) {
    if topics.is_empty() {
        return;
    }

    let filters = policy.filters(topics.iter());
    match client.subscribe_many(filters).await {
        Ok(()) => info!("{} session subscribed to {} topics", side, topics.len()),
        Err(err) => error!("{} session failed to subscribe: {}", side, err),
    }
}

async fn emit(events: &SessionEventSender, side: Side, event: SessionEvent) -> Result<()> {
    events
        .send((side, event))
        .await
        .map_err(|_| anyhow!("{} session event channel closed", side))
}

/// One logical connection to one broker: connect, subscribe-on-connect and
/// transparent reconnection live here. Inbound messages and connection state
/// changes are emitted as [`SessionEvent`]s; publishing happens through the
/// [`SessionHandle`] returned by [`BrokerSession::connect`].
pub struct BrokerSession {
    side: Side,
    host: String,
    port: u16,
    topics: Arc<[String]>,
    policy: SubscriptionPolicy,
    client: AsyncClient,
    eventloop: EventLoop,
    events: SessionEventSender,
}

impl BrokerSession {
    /// Build the client identity for `endpoint` and initiate the connection.
    /// The network link is actually established (and re-established) by the
    /// event loop inside [`run_forever`](Self::run_forever); an unreachable
    /// host is therefore reported there and retried, not returned here.
    pub fn connect(
        side: Side,
        endpoint: &EndpointConfig,
        topics: Arc<[String]>,
        events: SessionEventSender,
    ) -> Result<(Self, SessionHandle)> {
        let options = build_mqtt_options(endpoint);
        let (client, eventloop) = AsyncClient::new(options, 10_000);

        let handle = SessionHandle {
            side,
            client: client.clone(),
        };

        let session = Self {
            side,
            host: endpoint.host.clone(),
            port: endpoint.port,
            topics,
            policy: SubscriptionPolicy::mirror(),
            client,
            eventloop,
            events,
        };

        Ok((session, handle))
    }

    /// Drive the connection until an unrecoverable condition. Socket and
    /// protocol errors are logged and retried with backoff; only a closed
    /// request queue, a closed event channel or a malformed inbound message
    /// make this return, and the supervisor treats any return as fatal.
    ///
    /// The session is consumed into locals so that nothing borrowed across a
    /// suspension point drags the (non-`Sync`) event loop along; the future
    /// must stay `Send` for the supervisor to spawn it.
    pub async fn run_forever(self) -> Result<()> {
        let Self {
            side,
            host,
            port,
            topics,
            policy,
            client,
            mut eventloop,
            events,
        } = self;

        info!("Starting {} session, connecting to {}:{}", side, host, port);

        let mut state = SessionState::Connecting;
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(packet)) => match on_incoming(side, &mut state, packet)? {
                    PacketAction::Resubscribe => {
                        info!("{} session connected to {}:{}", side, host, port);
                        reconnect_delay = INITIAL_RECONNECT_DELAY;
                        subscribe_all(&client, side, &topics, &policy).await;
                        emit(&events, side, SessionEvent::Connected).await?;
                    }
                    PacketAction::Emit(event) => emit(&events, side, event).await?,
                    PacketAction::Ignore => {}
                },
                Ok(_) => {
                    // Outgoing notifications
                }
                Err(ConnectionError::RequestsDone) => {
                    bail!("{} session request queue closed", side);
                }
                Err(err) => {
                    match &err {
                        ConnectionError::Io(io_err) => {
                            error!("{} session transport fault: {}", side, io_err);
                        }
                        ConnectionError::Tls(tls_err) => {
                            error!("{} session TLS fault: {}", side, tls_err);
                        }
                        ConnectionError::ConnectionRefused(code) => {
                            error!("{} broker refused connection: {:?}", side, code);
                        }
                        other => {
                            error!("{} session connection error: {}", side, other);
                        }
                    }

                    if state == SessionState::Connected {
                        emit(&events, side, SessionEvent::Disconnected(None)).await?;
                    }

                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                    state = SessionState::Connecting;
                }
            }
        }
    }
}

fn build_mqtt_options(endpoint: &EndpointConfig) -> MqttOptions {
    let (address, port) = broker_location(endpoint);
    let mut options = MqttOptions::new(&endpoint.client_id, address, port);
    options.set_keep_alive(Duration::from_secs(60));

    if let (Some(username), Some(password)) = (&endpoint.username, &endpoint.password) {
        options.set_credentials(username, password);
    }

    if let Some(transport) = transport_for(endpoint) {
        options.set_transport(transport);
    }

    options
}

/// rumqttc addresses WebSocket brokers by full URL; plain sockets by host.
fn broker_location(endpoint: &EndpointConfig) -> (String, u16) {
    match endpoint.transport {
        TransportKind::Tcp => (endpoint.host.clone(), endpoint.port),
        TransportKind::Websocket => {
            let scheme = if endpoint.tls { "wss" } else { "ws" };
            (
                format!("{}://{}:{}/mqtt", scheme, endpoint.host, endpoint.port),
                endpoint.port,
            )
        }
    }
}

/// `None` keeps rumqttc's default plain TCP transport.
fn transport_for(endpoint: &EndpointConfig) -> Option<Transport> {
    match (endpoint.transport, endpoint.tls) {
        (TransportKind::Tcp, false) => None,
        (TransportKind::Tcp, true) => Some(Transport::tls_with_default_config()),
        (TransportKind::Websocket, false) => Some(Transport::ws()),
        (TransportKind::Websocket, true) => Some(Transport::wss_with_default_config()),
    }
}
