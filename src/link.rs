//! Link monitor
//!
//! Waits for the Ethernet link to come up and for DHCP to bind an address.
//! There is no timeout: until bring-up completes the board has nothing else
//! to do.

use core::net::Ipv4Addr;

use embedded_hal_async::delay::DelayNs;

use crate::config;
use crate::console::Console;
use crate::diag;

/// Network interface collaborator (Ethernet controller + IP stack)
#[allow(async_fn_in_trait)]
pub trait NetworkInterface {
    /// Initialize the controller. `false` means no hardware answered.
    async fn begin(&mut self) -> bool;

    /// Physical link is up
    fn is_linked(&self) -> bool;

    /// An address has been bound. Implies [`is_linked`](Self::is_linked).
    fn connected(&self) -> bool;

    /// The bound IPv4 address, if any
    fn local_address(&self) -> Option<Ipv4Addr>;
}

/// Polls link and address state at a fixed cadence
#[derive(Debug, Clone, Copy)]
pub struct LinkMonitor {
    poll_interval_ms: u32,
}

impl LinkMonitor {
    pub fn new(poll_interval_ms: u32) -> Self {
        Self { poll_interval_ms }
    }

    /// Block until the link is up and an address is bound, then return it.
    ///
    /// Emits one diagnostic per unsuccessful poll.
    pub async fn acquire_link<N, D, C>(&self, net: &mut N, delay: &mut D, console: &mut C) -> Ipv4Addr
    where
        N: NetworkInterface,
        D: DelayNs,
        C: Console,
    {
        while !net.is_linked() {
            diag!(console, "[ETH] Waiting for Ethernet link..");
            delay.delay_ms(self.poll_interval_ms).await;
        }

        loop {
            if net.connected() {
                if let Some(address) = net.local_address() {
                    diag!(console, "[ETH] Ethernet ready, IP address: {}", address);
                    return address;
                }
            }
            diag!(console, "[ETH] Waiting for DHCP address..");
            delay.delay_ms(self.poll_interval_ms).await;
        }
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new(config::LINK_POLL_INTERVAL_MS)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::NetworkInterface;
    use core::cell::Cell;
    use core::net::Ipv4Addr;

    /// Interface that reports link after `link_after` polls and an address
    /// `address_after` polls later
    pub struct ScriptedInterface {
        pub present: bool,
        pub link_after: u32,
        pub address_after: u32,
        pub address: Ipv4Addr,
        pub begin_calls: u32,
        link_polls: Cell<u32>,
        address_polls: Cell<u32>,
    }

    impl ScriptedInterface {
        pub fn new(link_after: u32, address_after: u32) -> Self {
            Self {
                present: true,
                link_after,
                address_after,
                address: Ipv4Addr::new(192, 168, 1, 42),
                begin_calls: 0,
                link_polls: Cell::new(0),
                address_polls: Cell::new(0),
            }
        }

        pub fn absent() -> Self {
            Self { present: false, ..Self::new(0, 0) }
        }
    }

    impl NetworkInterface for ScriptedInterface {
        async fn begin(&mut self) -> bool {
            self.begin_calls += 1;
            self.present
        }

        fn is_linked(&self) -> bool {
            let polls = self.link_polls.get();
            self.link_polls.set(polls + 1);
            polls >= self.link_after
        }

        fn connected(&self) -> bool {
            let polls = self.address_polls.get();
            self.address_polls.set(polls + 1);
            polls >= self.address_after
        }

        fn local_address(&self) -> Option<Ipv4Addr> {
            Some(self.address)
        }
    }
}

#[cfg(test)]
pub(crate) mod delay_testing {
    use embedded_hal_async::delay::DelayNs;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Delay that returns immediately and remembers what it was asked for
    #[derive(Clone, Default)]
    pub struct RecordingDelay {
        waits_ns: Rc<RefCell<Vec<u64>>>,
    }

    impl RecordingDelay {
        pub fn waits_ms(&self) -> Vec<u64> {
            self.waits_ns.borrow().iter().map(|ns| ns / 1_000_000).collect()
        }
    }

    impl DelayNs for RecordingDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.waits_ns.borrow_mut().push(u64::from(ns));
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.waits_ns.borrow_mut().push(u64::from(ms) * 1_000_000);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::delay_testing::RecordingDelay;
    use super::testing::ScriptedInterface;
    use super::*;
    use crate::console::testing::RecordingConsole;
    use embassy_futures::block_on;

    #[test]
    fn returns_immediately_when_already_up() {
        let mut net = ScriptedInterface::new(0, 0);
        let mut delay = RecordingDelay::default();
        let mut console = RecordingConsole::default();

        let address = block_on(LinkMonitor::default().acquire_link(&mut net, &mut delay, &mut console));

        assert_eq!(address, Ipv4Addr::new(192, 168, 1, 42));
        assert!(delay.waits_ms().is_empty());
        assert_eq!(console.lines(), ["[ETH] Ethernet ready, IP address: 192.168.1.42"]);
    }

    #[test]
    fn polls_link_then_address_once_per_second() {
        let mut net = ScriptedInterface::new(3, 2);
        let mut delay = RecordingDelay::default();
        let mut console = RecordingConsole::default();

        block_on(LinkMonitor::default().acquire_link(&mut net, &mut delay, &mut console));

        assert_eq!(console.count_containing("Waiting for Ethernet link"), 3);
        assert_eq!(console.count_containing("Waiting for DHCP address"), 2);
        assert_eq!(delay.waits_ms(), [1000; 5]);

        // Link waits all come before address waits
        let lines = console.lines();
        let last_link = lines.iter().rposition(|l| l.contains("link")).unwrap();
        let first_dhcp = lines.iter().position(|l| l.contains("DHCP")).unwrap();
        assert!(last_link < first_dhcp);
    }

    #[test]
    fn keeps_polling_while_bound_address_is_missing() {
        struct LateAddress {
            reads: core::cell::Cell<u32>,
        }

        impl NetworkInterface for LateAddress {
            async fn begin(&mut self) -> bool {
                true
            }
            fn is_linked(&self) -> bool {
                true
            }
            fn connected(&self) -> bool {
                true
            }
            fn local_address(&self) -> Option<Ipv4Addr> {
                let reads = self.reads.get();
                self.reads.set(reads + 1);
                (reads >= 1).then(|| Ipv4Addr::new(10, 0, 0, 7))
            }
        }

        let mut net = LateAddress { reads: core::cell::Cell::new(0) };
        let mut delay = RecordingDelay::default();
        let mut console = RecordingConsole::default();

        let address = block_on(LinkMonitor::new(250).acquire_link(&mut net, &mut delay, &mut console));

        assert_eq!(address, Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(delay.waits_ms(), [250]);
    }
}
