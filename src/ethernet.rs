//! Wired Ethernet module for ESP32-C3 board
//!
//! WIZnet W5500 / W5100S over SPI, driven by embassy-net-wiznet, with
//! addressing from the embassy-net DHCP client.

use core::net::Ipv4Addr;

use embassy_net::Stack;
use esp_println::println;

use crate::config;
use crate::link::NetworkInterface;

/// Ethernet controller selected at build time
#[cfg(feature = "w5500")]
pub type Chip = embassy_net_wiznet::chip::W5500;
#[cfg(all(feature = "w5100s", not(feature = "w5500")))]
pub type Chip = embassy_net_wiznet::chip::W5100S;

/// Network interface backed by an embassy-net stack.
///
/// Built without a stack when the controller did not answer during driver
/// init, so that bring-up can report the missing hardware.
pub struct EthernetManager<'a> {
    stack: Option<Stack<'a>>,
}

impl<'a> EthernetManager<'a> {
    pub fn new(stack: Stack<'a>) -> Self {
        Self { stack: Some(stack) }
    }

    /// No controller was found on the SPI bus
    pub fn absent() -> Self {
        Self { stack: None }
    }

    pub fn stack(&self) -> Option<Stack<'a>> {
        self.stack
    }
}

impl NetworkInterface for EthernetManager<'_> {
    async fn begin(&mut self) -> bool {
        if self.stack.is_none() {
            return false;
        }

        let mac = config::MAC_ADDRESS;
        println!(
            "[ETH] Controller initialized, MAC {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        );
        true
    }

    fn is_linked(&self) -> bool {
        self.stack.is_some_and(|stack| stack.is_link_up())
    }

    fn connected(&self) -> bool {
        self.stack.is_some_and(|stack| stack.is_link_up() && stack.is_config_up())
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        let config = self.stack?.config_v4()?;
        Some(config.address.address())
    }
}
