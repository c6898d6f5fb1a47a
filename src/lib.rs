#![cfg_attr(not(test), no_std)]

//! ESP32-C3 Wired Ethernet Broker Node Library
//!
//! Hardware-independent connectivity core for a board that brings up a WIZnet
//! Ethernet link, keeps an MQTT session alive, accepts over-the-network
//! firmware updates and blinks a heartbeat LED, all from one cooperative loop.
//!
//! Modules behind the `firmware` feature adapt the core to the real hardware.

pub mod broker;
pub mod clock;
pub mod console;
pub mod espota;
pub mod heartbeat;
pub mod link;
pub mod mdns;
pub mod scheduler;
pub mod update;

#[cfg(feature = "firmware")]
pub mod ethernet;
#[cfg(feature = "firmware")]
pub mod mqtt_client;
#[cfg(feature = "firmware")]
pub mod ota_server;

/// Project version information
pub const VERSION: &str = "0.1.0";

/// Default configuration constants
pub mod config {
    /// Link and DHCP polling cadence during bring-up
    pub const LINK_POLL_INTERVAL_MS: u32 = 1000;

    /// Delay between failed broker connection attempts
    pub const BROKER_RETRY_DELAY_MS: u32 = 5000;

    /// Heartbeat LED toggle period
    pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;

    /// Idle spin period after a fatal boot error
    pub const HALT_SPIN_MS: u32 = 100;

    /// Time given to the serial console to come up before the banner
    pub const CONSOLE_WARMUP_MS: u64 = 2000;

    /// Broker configuration
    /// Read from environment variables at compile time
    pub const BROKER_HOST: &str = env!("BROKER_HOST");
    pub const BROKER_CLIENT_ID: &str = env!("BROKER_CLIENT_ID");
    pub const BROKER_USERNAME: &str = env!("BROKER_USERNAME");
    pub const BROKER_PASSWORD: &str = env!("BROKER_PASSWORD");
    pub const BROKER_TOPIC: &str = env!("BROKER_TOPIC");

    /// Broker TCP port
    pub const BROKER_PORT: u16 = 1883;

    /// Payload published to the topic after every (re)connect
    pub const ANNOUNCE_PAYLOAD: &str = "hello world";

    /// MQTT keep-alive advertised in CONNECT
    pub const MQTT_KEEPALIVE_SECS: u16 = 15;

    /// MQTT client transmit and receive buffer size
    pub const MQTT_MAX_PACKET_SIZE: usize = 512;

    /// Failed polls in a row before the broker connection counts as lost
    pub const MQTT_POLL_FAULT_LIMIT: u8 = 3;

    /// Device hostname used for mDNS
    pub const HOSTNAME: &str = env!("DEVICE_HOSTNAME");

    /// UDP port the update service listens on for invitations
    pub const OTA_PORT: u16 = 8266;

    /// Abort an update transfer after this long without data
    pub const OTA_RECEIVE_TIMEOUT_MS: u64 = 10_000;

    /// mDNS periodic announcement interval
    pub const MDNS_ANNOUNCE_INTERVAL_MS: u64 = 30_000;

    /// Locally administered MAC address for the Ethernet controller
    pub const MAC_ADDRESS: [u8; 6] = [0x02, 0x00, 0x00, 0x57, 0x55, 0x00];

    /// Ethernet controller SPI wiring
    pub const ETH_SCLK_PIN: u8 = 6;
    pub const ETH_MOSI_PIN: u8 = 7;
    pub const ETH_MISO_PIN: u8 = 2;
    pub const ETH_CS_PIN: u8 = 10;
    pub const ETH_INT_PIN: u8 = 3;
    pub const ETH_RST_PIN: u8 = 4;

    /// Heartbeat LED GPIO pin
    pub const LED_PIN: u8 = 8;
}

/// Error types for the Ethernet board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardError {
    /// No Ethernet controller answered during bring-up
    HardwareNotFound,
    /// Broker transport error
    BrokerError,
    /// Update transport error
    UpdateError,
    /// Protocol parsing error
    ProtocolError,
    /// mDNS packet could not be built
    MdnsError,
}

impl core::fmt::Display for BoardError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            BoardError::HardwareNotFound => "no wired Ethernet hardware detected",
            BoardError::BrokerError => "broker transport error",
            BoardError::UpdateError => "update transport error",
            BoardError::ProtocolError => "malformed protocol data",
            BoardError::MdnsError => "mDNS packet does not fit",
        };
        f.write_str(text)
    }
}
