#![no_std]
#![no_main]

use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::rng::Rng;
use esp_hal::spi::Mode;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::Async;
use esp_println::println;

// Embassy imports
use embassy_executor::Spawner;
use embassy_net::{Config, Stack, StackResources};
use embassy_time::{Delay, Duration, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal_embassy::Executor;
use static_cell::{ConstStaticCell, StaticCell};

// Import our library modules
use eth_board::broker::BrokerSession;
use eth_board::clock::EmbassyClock;
use eth_board::config;
use eth_board::console::SerialConsole;
use eth_board::ethernet::{Chip, EthernetManager};
use eth_board::heartbeat::Heartbeat;
use eth_board::ota_server::{OtaBuffers, OtaServer};
use eth_board::scheduler::Scheduler;
use eth_board::update::UpdateService;

#[cfg(feature = "broker")]
use eth_board::broker::BrokerConfig;
#[cfg(feature = "broker")]
use eth_board::mqtt_client::MqttTransport;

// Add app descriptor for espflash compatibility
esp_bootloader_esp_idf::esp_app_desc!();

type EthernetSpi = ExclusiveDevice<Spi<'static, Async>, Output<'static>, Delay>;
type EthernetRunner = embassy_net_wiznet::Runner<'static, Chip, EthernetSpi, Input<'static>, Output<'static>>;

// Static cells for embassy components
static WIZNET_STATE: StaticCell<embassy_net_wiznet::State<8, 8>> = StaticCell::new();
static STACK_RESOURCES: StaticCell<StackResources<8>> = StaticCell::new();
static OTA_BUFFERS: ConstStaticCell<OtaBuffers> = ConstStaticCell::new(OtaBuffers::new());
#[cfg(feature = "broker")]
static MQTT_RX: ConstStaticCell<[u8; 1024]> = ConstStaticCell::new([0; 1024]);
#[cfg(feature = "broker")]
static MQTT_TX: ConstStaticCell<[u8; 1024]> = ConstStaticCell::new([0; 1024]);

// Static executor for embassy tasks
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

/// Peripherals handed to the board task
struct Board {
    spi: EthernetSpi,
    int: Input<'static>,
    reset: Output<'static>,
    led: Output<'static>,
    seed: u64,
}

// Embassy task to run the Ethernet controller
#[embassy_executor::task]
async fn wiznet_task(runner: EthernetRunner) -> ! {
    runner.run().await
}

// Embassy task to run the network stack
#[embassy_executor::task]
async fn net_task(mut runner: embassy_net::Runner<'static, embassy_net_wiznet::Device<'static>>) -> ! {
    runner.run().await
}

/// Bring up the Ethernet driver, then run the scheduler forever
#[embassy_executor::task]
async fn board_task(spawner: Spawner, board: Board) {
    Timer::after(Duration::from_millis(config::CONSOLE_WARMUP_MS)).await;
    println!("[BOOT] eth-board v{}", eth_board::VERSION);

    let state = WIZNET_STATE.init(embassy_net_wiznet::State::new());
    let stack: Option<Stack<'static>> =
        match embassy_net_wiznet::new(config::MAC_ADDRESS, state, board.spi, board.int, board.reset).await {
            Ok((device, runner)) => {
                spawner.spawn(wiznet_task(runner)).ok();

                let resources = STACK_RESOURCES.init(StackResources::new());
                let (stack, runner) = embassy_net::new(device, Config::dhcpv4(Default::default()), resources, board.seed);
                spawner.spawn(net_task(runner)).ok();
                Some(stack)
            }
            Err(e) => {
                println!("[ETH] Controller init failed: {:?}", e);
                None
            }
        };

    let net = stack.map_or_else(EthernetManager::absent, EthernetManager::new);
    let update = UpdateService::new(stack.map(|stack| OtaServer::new(stack, OTA_BUFFERS.take())));

    #[cfg(feature = "broker")]
    let broker = stack.map(|stack| {
        let transport = MqttTransport::new(stack, MQTT_RX.take(), MQTT_TX.take());
        BrokerSession::new(transport, BrokerConfig::default())
    });
    #[cfg(not(feature = "broker"))]
    let broker: Option<BrokerSession<core::convert::Infallible>> = None;

    let scheduler = Scheduler::new(
        net,
        broker,
        update,
        Heartbeat::with_default_interval(board.led),
        Delay,
        EmbassyClock,
        SerialConsole,
    );

    println!("[STATE] Starting scheduler");
    scheduler.run().await;
}

#[esp_hal::main]
fn main() -> ! {
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // Initialize embassy time system
    let timer_group0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timer_group0.timer0);

    let mut rng = Rng::new(peripherals.RNG);
    let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());

    // Ethernet controller on SPI2
    println!(
        "[ETH] SPI on SCLK={} MOSI={} MISO={} CS={}, INT={}, RST={}",
        config::ETH_SCLK_PIN,
        config::ETH_MOSI_PIN,
        config::ETH_MISO_PIN,
        config::ETH_CS_PIN,
        config::ETH_INT_PIN,
        config::ETH_RST_PIN
    );
    let spi_bus = Spi::new(
        peripherals.SPI2,
        SpiConfig::default().with_frequency(Rate::from_mhz(20)).with_mode(Mode::_0),
    )
    .unwrap()
    .with_sck(peripherals.GPIO6)
    .with_mosi(peripherals.GPIO7)
    .with_miso(peripherals.GPIO2)
    .into_async();
    let cs = Output::new(peripherals.GPIO10, Level::High, OutputConfig::default());
    let spi = ExclusiveDevice::new(spi_bus, cs, Delay).unwrap();

    let int = Input::new(peripherals.GPIO3, InputConfig::default().with_pull(Pull::Up));
    let reset = Output::new(peripherals.GPIO4, Level::High, OutputConfig::default());

    // Heartbeat LED
    println!("[LED] Heartbeat on GPIO{}", config::LED_PIN);
    let led = Output::new(peripherals.GPIO8, Level::Low, OutputConfig::default());

    let board = Board {
        spi,
        int,
        reset,
        led,
        seed,
    };

    // Initialize embassy executor and run tasks
    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        println!("[MAIN] Spawning board task...");
        spawner.spawn(board_task(spawner, board)).ok();
    });
}
