//! MQTT transport over an embassy-net TCP socket
//!
//! Adapts a `myrtio-mqtt` client to [`BrokerTransport`]. The client is built
//! on the first connect, once the broker host has been resolved, and reused
//! for every reconnect after that.

use core::fmt::Write as _;
use core::net::Ipv4Addr;

use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::{IpAddress, Stack};
use embassy_time::{Duration, with_timeout};
use esp_println::println;
use heapless::String;
use myrtio_mqtt::client::{MqttClient, MqttEvent, MqttOptions};
use myrtio_mqtt::packet::QoS;
use myrtio_mqtt::transport::TcpTransport;
use static_cell::StaticCell;

use crate::broker::{BrokerTransport, InboundMessage, PollFaults, TransportState};
use crate::{BoardError, config};

/// Socket read timeout inside the client
const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on the TCP connect plus CONNECT/CONNACK exchange
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long one `poll` waits for inbound traffic
const POLL_WINDOW: Duration = Duration::from_millis(5);

const MAX_TOPICS: usize = 4;

/// Dotted-quad form of the resolved broker address
static BROKER_ADDRESS: StaticCell<String<15>> = StaticCell::new();

type Client<'a> = MqttClient<'a, TcpTransport<'a>, MAX_TOPICS, { config::MQTT_MAX_PACKET_SIZE }>;

pub struct MqttTransport<'a> {
    stack: Stack<'a>,
    socket: Option<TcpSocket<'a>>,
    client: Option<Client<'a>>,
    host: &'static str,
    port: u16,
    state: TransportState,
    faults: PollFaults,
}

impl<'a> MqttTransport<'a> {
    pub fn new(stack: Stack<'a>, socket_rx: &'a mut [u8], socket_tx: &'a mut [u8]) -> Self {
        Self {
            stack,
            socket: Some(TcpSocket::new(stack, socket_rx, socket_tx)),
            client: None,
            host: config::BROKER_HOST,
            port: config::BROKER_PORT,
            state: TransportState::Disconnected,
            faults: PollFaults::default(),
        }
    }

    /// Broker address as the client expects it: an IPv4 literal
    async fn resolve(&self) -> Option<&'static str> {
        let address = match self.host.parse::<Ipv4Addr>() {
            Ok(_) => return Some(self.host),
            Err(_) => match self.stack.dns_query(self.host, DnsQueryType::A).await {
                Ok(addresses) => match addresses.first() {
                    Some(IpAddress::Ipv4(address)) => *address,
                    _ => return None,
                },
                Err(e) => {
                    println!("[MQTT] DNS lookup for {} failed: {:?}", self.host, e);
                    return None;
                }
            },
        };

        let mut text = String::new();
        write!(text, "{}", address).ok()?;
        let text: &'static String<15> = BROKER_ADDRESS.try_init(text)?;
        Some(text.as_str())
    }

    /// Build the client around the socket on first use
    async fn client(
        &mut self,
        client_id: &'static str,
        username: &'static str,
        password: &'static str,
    ) -> Option<&mut Client<'a>> {
        if self.client.is_none() {
            let address = self.resolve().await?;
            let socket = self.socket.take()?;
            let options = MqttOptions::new(client_id, address, self.port)
                .with_keep_alive(Duration::from_secs(u64::from(config::MQTT_KEEPALIVE_SECS)))
                .with_credentials(username, password);
            println!("[MQTT] Broker {} resolved to {}", self.host, address);
            self.client = Some(MqttClient::new(TcpTransport::new(socket, READ_TIMEOUT), options));
        }
        self.client.as_mut()
    }
}

impl BrokerTransport for MqttTransport<'_> {
    fn set_server(&mut self, host: &'static str, port: u16) {
        self.host = host;
        self.port = port;
    }

    async fn connect(
        &mut self,
        client_id: &'static str,
        username: &'static str,
        password: &'static str,
    ) -> bool {
        let Some(client) = self.client(client_id, username, password).await else {
            self.state = TransportState::ConnectFailed;
            return false;
        };

        self.state = match with_timeout(CONNECT_TIMEOUT, client.connect()).await {
            Ok(Ok(_)) => TransportState::Connected,
            Ok(Err(e)) => {
                println!("[MQTT] {}: {:?}", BoardError::BrokerError, e);
                TransportState::ConnectFailed
            }
            Err(_) => TransportState::ConnectionTimeout,
        };
        self.faults.clear();
        self.state == TransportState::Connected
    }

    fn connected(&self) -> bool {
        self.client.is_some() && self.state == TransportState::Connected
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };

        match client.publish(topic, payload, QoS::AtMostOnce).await {
            Ok(_) => true,
            Err(e) => {
                println!("[MQTT] Publish to {} failed: {:?}", topic, e);
                self.state = TransportState::ConnectionLost;
                false
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };

        match client.subscribe(topic, QoS::AtMostOnce).await {
            Ok(_) => true,
            Err(e) => {
                println!("[MQTT] Subscribe to {} failed: {:?}", topic, e);
                false
            }
        }
    }

    async fn poll(&mut self) -> Option<InboundMessage<'_>> {
        if self.state != TransportState::Connected {
            return None;
        }
        let client = self.client.as_mut()?;

        match with_timeout(POLL_WINDOW, client.poll()).await {
            Ok(Ok(Some(MqttEvent::Publish(message)))) => {
                self.faults.clear();
                Some(InboundMessage {
                    topic: message.topic,
                    payload: message.payload,
                })
            }
            Ok(Ok(_)) => {
                self.faults.clear();
                None
            }
            Ok(Err(e)) => {
                // Oversized or undecodable packets are dropped by the client;
                // only a run of failures means the socket is gone
                if self.faults.record() {
                    println!("[MQTT] {}: {:?}", BoardError::BrokerError, e);
                    self.state = TransportState::ConnectionLost;
                } else {
                    println!("[MQTT] Skipped inbound packet: {:?}", e);
                }
                None
            }
            Err(_) => None,
        }
    }

    fn state(&self) -> TransportState {
        self.state
    }
}
