//! Broker session manager
//!
//! Owns the Connected/Disconnected state of the MQTT session. When the
//! session is down it retries forever with a fixed back-off, and after every
//! successful connect it republishes the announcement and resubscribes.

use embedded_hal_async::delay::DelayNs;

use crate::config;
use crate::console::Console;
use crate::diag;

/// Logical state of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

/// Transport status, using the conventional MQTT client return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    ConnectionTimeout,
    ConnectionLost,
    ConnectFailed,
    Disconnected,
    Connected,
    BadProtocol,
    BadClientId,
    Unavailable,
    BadCredentials,
    Unauthorized,
}

impl TransportState {
    /// Numeric code printed in diagnostics
    pub fn code(self) -> i8 {
        match self {
            TransportState::ConnectionTimeout => -4,
            TransportState::ConnectionLost => -3,
            TransportState::ConnectFailed => -2,
            TransportState::Disconnected => -1,
            TransportState::Connected => 0,
            TransportState::BadProtocol => 1,
            TransportState::BadClientId => 2,
            TransportState::Unavailable => 3,
            TransportState::BadCredentials => 4,
            TransportState::Unauthorized => 5,
        }
    }
}

/// Consecutive failed polls, reset by any successful one.
///
/// A single undecodable or oversized inbound packet is skipped; the
/// connection only counts as lost once `limit` polls in a row have failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFaults {
    consecutive: u8,
    limit: u8,
}

impl PollFaults {
    pub const fn new(limit: u8) -> Self {
        Self { consecutive: 0, limit }
    }

    /// Count a failed poll. Returns `true` once the limit is reached.
    pub fn record(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.limit
    }

    pub fn clear(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u8 {
        self.consecutive
    }
}

impl Default for PollFaults {
    fn default() -> Self {
        Self::new(config::MQTT_POLL_FAULT_LIMIT)
    }
}

/// An inbound PUBLISH handed out by [`BrokerTransport::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundMessage<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
}

/// Broker transport collaborator (MQTT client)
#[allow(async_fn_in_trait)]
pub trait BrokerTransport {
    /// Remember the broker endpoint used by later connects
    fn set_server(&mut self, host: &'static str, port: u16);

    /// Open the transport and perform the protocol handshake
    async fn connect(
        &mut self,
        client_id: &'static str,
        username: &'static str,
        password: &'static str,
    ) -> bool;

    /// Transport is still connected
    fn connected(&self) -> bool;

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;

    async fn subscribe(&mut self, topic: &str) -> bool;

    /// Service pending I/O once. Returns an inbound message if one arrived.
    async fn poll(&mut self) -> Option<InboundMessage<'_>>;

    /// Status of the last operation
    fn state(&self) -> TransportState;
}

/// Receives inbound messages dispatched by [`BrokerSession::pump_messages`]
pub trait MessageHandler {
    fn on_message<C: Console>(&mut self, console: &mut C, topic: &str, payload: &[u8]);
}

/// Default handler: print the message to the console
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoMessages;

impl MessageHandler for EchoMessages {
    fn on_message<C: Console>(&mut self, console: &mut C, topic: &str, payload: &[u8]) {
        match core::str::from_utf8(payload) {
            Ok(text) => diag!(console, "[MQTT] Message arrived [{}] {}", topic, text),
            Err(_) => diag!(console, "[MQTT] Message arrived [{}] {:02x?}", topic, payload),
        }
    }
}

/// Fixed session identity and endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: &'static str,
    pub port: u16,
    pub client_id: &'static str,
    pub username: &'static str,
    pub password: &'static str,
    pub topic: &'static str,
    pub announce: &'static str,
    pub retry_delay_ms: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: config::BROKER_HOST,
            port: config::BROKER_PORT,
            client_id: config::BROKER_CLIENT_ID,
            username: config::BROKER_USERNAME,
            password: config::BROKER_PASSWORD,
            topic: config::BROKER_TOPIC,
            announce: config::ANNOUNCE_PAYLOAD,
            retry_delay_ms: config::BROKER_RETRY_DELAY_MS,
        }
    }
}

/// The broker session and its transport
pub struct BrokerSession<T, H = EchoMessages> {
    transport: T,
    handler: H,
    config: BrokerConfig,
    state: SessionState,
}

impl<T: BrokerTransport> BrokerSession<T> {
    pub fn new(transport: T, config: BrokerConfig) -> Self {
        Self::with_handler(transport, config, EchoMessages)
    }
}

impl<T: BrokerTransport, H: MessageHandler> BrokerSession<T, H> {
    pub fn with_handler(transport: T, config: BrokerConfig, handler: H) -> Self {
        Self {
            transport,
            handler,
            config,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Point the transport at the configured broker
    pub fn configure(&mut self) {
        self.transport.set_server(self.config.host, self.config.port);
    }

    /// Return at once while connected; otherwise run the reconnect protocol.
    ///
    /// The reconnect protocol has no attempt limit and waits
    /// `retry_delay_ms` after each failure. Nothing else is serviced while it
    /// runs.
    pub async fn ensure_connected<D: DelayNs, C: Console>(&mut self, delay: &mut D, console: &mut C) {
        let transport_up = self.transport.connected();
        if self.state == SessionState::Connected && transport_up {
            return;
        }

        if self.state == SessionState::Connected {
            diag!(console, "[MQTT] Connection lost (rc={})", self.transport.state().code());
            self.state = SessionState::Disconnected;
        }

        loop {
            diag!(console, "[MQTT] Attempting connection to {}:{}...", self.config.host, self.config.port);

            let config = self.config;
            if self
                .transport
                .connect(config.client_id, config.username, config.password)
                .await
            {
                diag!(console, "[MQTT] Connected");
                self.state = SessionState::Connected;
                self.announce(console).await;
                return;
            }

            diag!(
                console,
                "[MQTT] Connection failed, rc={} try again in {} seconds",
                self.transport.state().code(),
                config.retry_delay_ms / 1000
            );
            delay.delay_ms(config.retry_delay_ms).await;
        }
    }

    /// Publish the announcement and subscribe to the topic.
    ///
    /// Failures are reported but leave the session Connected.
    async fn announce<C: Console>(&mut self, console: &mut C) {
        let topic = self.config.topic;
        let payload = self.config.announce;

        if self.transport.publish(topic, payload.as_bytes()).await {
            diag!(console, "[MQTT] Published '{}' to topic \"{}\" OK!", payload, topic);
        } else {
            diag!(console, "[MQTT] Publishing topic \"{}\" FAILED!", topic);
        }

        if self.transport.subscribe(topic).await {
            diag!(console, "[MQTT] Subscribing to topic \"{}\" OK!", topic);
        } else {
            diag!(console, "[MQTT] Subscribing to topic \"{}\" FAILED!", topic);
        }
    }

    /// Service one round of transport traffic and dispatch an inbound message
    pub async fn pump_messages<C: Console>(&mut self, console: &mut C) {
        if let Some(message) = self.transport.poll().await {
            self.handler.on_message(console, message.topic, message.payload);
        }
    }
}
