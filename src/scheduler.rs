//! Cooperative scheduler
//!
//! Drives the board through a one-time bring-up and then services the
//! update transport, the broker session and the heartbeat in a fixed round,
//! forever. Everything runs on the calling task; the only wait without a
//! bound is the broker reconnect protocol.

use core::convert::Infallible;
use core::net::Ipv4Addr;

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;

use crate::broker::{BrokerSession, BrokerTransport, InboundMessage, TransportState};
use crate::clock::Clock;
use crate::config;
use crate::console::Console;
use crate::diag;
use crate::heartbeat::Heartbeat;
use crate::link::{LinkMonitor, NetworkInterface};
use crate::update::{UpdateService, UpdateTransport};
use crate::BoardError;

/// Scheduler states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    /// Hardware init, link and address acquisition, service setup
    Bootstrapping,
    /// Cyclic servicing of update, broker and heartbeat
    Steady,
}

/// Top-level owner of every component
pub struct Scheduler<N, B, U, P, D, K, C> {
    current_state: SystemState,
    address: Option<Ipv4Addr>,
    iterations: u64,
    net: N,
    link: LinkMonitor,
    broker: Option<BrokerSession<B>>,
    update: UpdateService<U>,
    heartbeat: Heartbeat<P>,
    delay: D,
    clock: K,
    console: C,
}

impl<N, B, U, P, D, K, C> Scheduler<N, B, U, P, D, K, C>
where
    N: NetworkInterface,
    B: BrokerTransport,
    U: UpdateTransport,
    P: OutputPin,
    D: DelayNs,
    K: Clock,
    C: Console,
{
    /// Compose the scheduler. Pass `None` as `broker` for an update-only node.
    pub fn new(
        net: N,
        broker: Option<BrokerSession<B>>,
        update: UpdateService<U>,
        heartbeat: Heartbeat<P>,
        delay: D,
        clock: K,
        console: C,
    ) -> Self {
        Self {
            current_state: SystemState::Bootstrapping,
            address: None,
            iterations: 0,
            net,
            link: LinkMonitor::default(),
            broker,
            update,
            heartbeat,
            delay,
            clock,
            console,
        }
    }

    /// Replace the default link monitor
    pub fn with_link_monitor(mut self, link: LinkMonitor) -> Self {
        self.link = link;
        self
    }

    pub fn get_current_state(&self) -> SystemState {
        self.current_state
    }

    /// Address bound during bring-up
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    /// Completed steady-state rounds
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn broker(&self) -> Option<&BrokerSession<B>> {
        self.broker.as_ref()
    }

    pub fn update(&self) -> &UpdateService<U> {
        &self.update
    }

    pub fn heartbeat(&self) -> &Heartbeat<P> {
        &self.heartbeat
    }

    /// Bring the board up. Runs once; a second call returns the bound address.
    ///
    /// Fails only when the Ethernet controller is missing, in which case the
    /// scheduler stays in [`SystemState::Bootstrapping`] and nothing else is
    /// touched.
    pub async fn bootstrap(&mut self) -> Result<Ipv4Addr, BoardError> {
        if let (SystemState::Steady, Some(address)) = (self.current_state, self.address) {
            return Ok(address);
        }

        diag!(self.console, "[BOOT] Booting");

        if !self.net.begin().await {
            diag!(self.console, "[ETH] No wired Ethernet hardware detected. Check pinouts, wiring.");
            return Err(BoardError::HardwareNotFound);
        }

        let address = self
            .link
            .acquire_link(&mut self.net, &mut self.delay, &mut self.console)
            .await;
        self.address = Some(address);

        self.update.begin(&mut self.console).await;

        if let Some(broker) = self.broker.as_mut() {
            broker.configure();
            let config = broker.config();
            diag!(self.console, "[MQTT] Broker set to {}:{}", config.host, config.port);
        }

        self.transition_to_state(SystemState::Steady);
        Ok(address)
    }

    /// One steady-state round: update, broker, heartbeat.
    ///
    /// Returns `false` without doing anything before bring-up has completed.
    pub async fn iterate(&mut self) -> bool {
        if self.current_state != SystemState::Steady {
            return false;
        }

        self.update.poll(&mut self.console).await;

        if let Some(broker) = self.broker.as_mut() {
            broker.ensure_connected(&mut self.delay, &mut self.console).await;
            broker.pump_messages(&mut self.console).await;
        }

        let now = self.clock.now_ms();
        self.heartbeat.tick(now);

        self.iterations += 1;
        true
    }

    /// Bring up, then iterate forever. Never returns.
    ///
    /// A missing Ethernet controller halts here in an idle spin so the
    /// diagnostics stay readable.
    pub async fn run(mut self) {
        if self.bootstrap().await.is_err() {
            loop {
                self.delay.delay_ms(config::HALT_SPIN_MS).await;
            }
        }

        loop {
            self.iterate().await;
            // Let the network stack tasks run between rounds
            embassy_futures::yield_now().await;
        }
    }

    fn transition_to_state(&mut self, new_state: SystemState) {
        if new_state != self.current_state {
            if new_state == SystemState::Steady {
                diag!(self.console, "[STATE] System operational");
            }
            self.current_state = new_state;
        }
    }
}

/// Stand-in transport for nodes built without a broker session
impl BrokerTransport for Infallible {
    fn set_server(&mut self, _host: &'static str, _port: u16) {
        match *self {}
    }

    async fn connect(
        &mut self,
        _client_id: &'static str,
        _username: &'static str,
        _password: &'static str,
    ) -> bool {
        match *self {}
    }

    fn connected(&self) -> bool {
        match *self {}
    }

    async fn publish(&mut self, _topic: &str, _payload: &[u8]) -> bool {
        match *self {}
    }

    async fn subscribe(&mut self, _topic: &str) -> bool {
        match *self {}
    }

    async fn poll(&mut self) -> Option<InboundMessage<'_>> {
        match *self {}
    }

    fn state(&self) -> TransportState {
        match *self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::MockTransport;
    use crate::broker::{BrokerConfig, SessionState};
    use crate::console::testing::RecordingConsole;
    use crate::link::delay_testing::RecordingDelay;
    use crate::link::testing::ScriptedInterface;
    use crate::update::testing::{HookCall, ScriptedUpdates};
    use crate::update::{UpdateError, UpdateTarget};
    use core::cell::Cell;
    use embassy_futures::block_on;
    use std::rc::Rc;

    struct FakeLed;

    impl embedded_hal::digital::ErrorType for FakeLed {
        type Error = Infallible;
    }

    impl OutputPin for FakeLed {
        fn set_low(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    /// Clock advanced by the test
    #[derive(Clone, Default)]
    struct ManualClock(Rc<Cell<u64>>);

    impl ManualClock {
        fn advance(&self, ms: u64) {
            self.0.set(self.0.get() + ms);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }
    }

    type TestScheduler<B> =
        Scheduler<ScriptedInterface, B, ScriptedUpdates, FakeLed, RecordingDelay, ManualClock, RecordingConsole>;

    fn scheduler(
        net: ScriptedInterface,
        broker: Option<MockTransport>,
        script: &[HookCall],
    ) -> (TestScheduler<MockTransport>, RecordingDelay, ManualClock, RecordingConsole) {
        let delay = RecordingDelay::default();
        let clock = ManualClock::default();
        let console = RecordingConsole::default();
        let updates = ScriptedUpdates {
            script: script.iter().copied().collect(),
            ..Default::default()
        };
        let scheduler = Scheduler::new(
            net,
            broker.map(|transport| BrokerSession::new(transport, BrokerConfig::default())),
            UpdateService::new(updates),
            Heartbeat::new(FakeLed, 2000),
            delay.clone(),
            clock.clone(),
            console.clone(),
        );
        (scheduler, delay, clock, console)
    }

    #[test]
    fn missing_hardware_never_reaches_steady() {
        let (mut scheduler, delay, _clock, console) =
            scheduler(ScriptedInterface::absent(), Some(MockTransport::new(0)), &[]);

        assert_eq!(block_on(scheduler.bootstrap()), Err(BoardError::HardwareNotFound));
        assert!(!block_on(scheduler.iterate()));

        assert_eq!(scheduler.get_current_state(), SystemState::Bootstrapping);
        assert_eq!(scheduler.iterations(), 0);
        let broker = scheduler.broker().unwrap();
        assert_eq!(broker.transport().operations(), 0);
        assert_eq!(broker.transport().server, None);
        assert_eq!(broker.transport().polls, 0);
        assert!(!scheduler.update().transport().began);
        assert_eq!(scheduler.update().transport().handled, 0);
        assert!(delay.waits_ms().is_empty());
        assert_eq!(
            console.lines(),
            ["[BOOT] Booting", "[ETH] No wired Ethernet hardware detected. Check pinouts, wiring."]
        );
    }

    #[test]
    fn bootstrap_configures_services_and_goes_steady() {
        let (mut scheduler, _delay, _clock, console) =
            scheduler(ScriptedInterface::new(0, 0), Some(MockTransport::new(0)), &[]);

        let address = block_on(scheduler.bootstrap()).unwrap();

        assert_eq!(address, Ipv4Addr::new(192, 168, 1, 42));
        assert_eq!(scheduler.get_current_state(), SystemState::Steady);
        assert_eq!(scheduler.address(), Some(address));
        assert!(scheduler.update().transport().began);
        let broker = scheduler.broker().unwrap();
        assert_eq!(broker.transport().server, Some(("public.cloud.shiftr.io", 1883)));
        // Bring-up does not connect to the broker; the first round does
        assert_eq!(broker.transport().connects, 0);
        assert_eq!(console.lines().last().unwrap(), "[STATE] System operational");
    }

    #[test]
    fn bootstrap_runs_once() {
        let (mut scheduler, _delay, _clock, _console) =
            scheduler(ScriptedInterface::new(0, 0), Some(MockTransport::new(0)), &[]);

        block_on(scheduler.bootstrap()).unwrap();
        block_on(scheduler.bootstrap()).unwrap();

        assert_eq!(scheduler.net.begin_calls, 1);
    }

    #[test]
    fn steady_round_services_everything() {
        let (mut scheduler, delay, clock, console) = scheduler(
            ScriptedInterface::new(0, 0),
            Some(MockTransport::new(1)),
            &[HookCall::Start(UpdateTarget::Application), HookCall::End],
        );
        block_on(scheduler.bootstrap()).unwrap();

        clock.advance(2000);
        assert!(block_on(scheduler.iterate()));
        assert!(block_on(scheduler.iterate()));

        let broker = scheduler.broker().unwrap();
        assert_eq!(broker.state(), SessionState::Connected);
        assert_eq!(broker.transport().connects, 2);
        assert_eq!(broker.transport().polls, 2);
        assert_eq!(scheduler.update().transport().handled, 2);
        assert_eq!(delay.waits_ms(), [5000]);
        assert!(scheduler.heartbeat().level());
        assert_eq!(scheduler.iterations(), 2);
        assert_eq!(console.count_containing("[OTA] Start updating sketch"), 1);
        assert_eq!(console.count_containing("[OTA] End"), 1);
    }

    #[test]
    fn update_errors_are_reported_and_servicing_continues() {
        let (mut scheduler, _delay, clock, console) = scheduler(
            ScriptedInterface::new(0, 0),
            Some(MockTransport::new(0)),
            &[
                HookCall::Start(UpdateTarget::Application),
                HookCall::Progress(1460, 4096),
                HookCall::Error(UpdateError::Receive),
            ],
        );
        block_on(scheduler.bootstrap()).unwrap();

        for _ in 0..4 {
            clock.advance(1000);
            assert!(block_on(scheduler.iterate()));
        }

        assert_eq!(scheduler.get_current_state(), SystemState::Steady);
        assert_eq!(scheduler.iterations(), 4);
        assert!(scheduler.update().session().is_none());
        assert_eq!(scheduler.update().transport().handled, 4);
        let broker = scheduler.broker().unwrap();
        assert_eq!(broker.state(), SessionState::Connected);
        assert_eq!(broker.transport().polls, 4);
        assert_eq!(console.count_containing("[OTA] Error[3]: Receive Failed"), 1);
        assert_eq!(scheduler.heartbeat().last_toggle_ms(), 4000);
    }

    #[test]
    fn update_only_node_skips_broker() {
        let delay = RecordingDelay::default();
        let clock = ManualClock::default();
        let console = RecordingConsole::default();
        let mut scheduler: TestScheduler<Infallible> = Scheduler::new(
            ScriptedInterface::new(1, 1),
            None,
            UpdateService::new(ScriptedUpdates::default()),
            Heartbeat::new(FakeLed, 2000),
            delay.clone(),
            clock.clone(),
            console.clone(),
        );

        block_on(scheduler.bootstrap()).unwrap();
        for _ in 0..3 {
            clock.advance(2000);
            block_on(scheduler.iterate());
        }

        assert!(scheduler.broker().is_none());
        assert_eq!(scheduler.update().transport().handled, 3);
        assert_eq!(scheduler.heartbeat().last_toggle_ms(), 6000);
        assert_eq!(console.count_containing("[MQTT]"), 0);
        assert_eq!(delay.waits_ms(), [1000, 1000]);
    }
}
