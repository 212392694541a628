//! Telenode - Resilient Sensor Node Telemetry Firmware
//!
//! Firmware binary for ESP32-C3 boards with an INA226 current monitor.
//! Samples on a timer, publishes over MQTT when a value moved or the
//! period ran out, and restarts itself when the radio or broker fails.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;

use defmt::*;
use embassy_executor::Spawner;
use embassy_net::{DhcpConfig, StackResources};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use esp_hal::clock::CpuClock;
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::rng::Rng;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::Async;
use panic_rtt_target as _;
use static_cell::StaticCell;

use telenode_core::config::{ConfigSet, Ina226Config, NodeConfig};
use telenode_core::policy::SendTrigger;
use telenode_core::scheduler::{measure_now, Node};
use telenode_core::supervisor::{Identity, Supervisor};
use telenode_core::traits::{Clock, NoEnvironmentalSensor};
use telenode_drivers::{Averaging, ConversionTime, Ina226};
use telenode_hal::I2cBus;

mod board;
mod mqtt;
mod radio;
mod sntp;
mod tasks;

use board::Board;
use mqtt::BrokerClient;
use radio::EspRadio;

esp_bootloader_esp_idf::esp_app_desc!();

/// Validated configuration set, encoded by build.rs
static EMBEDDED_CONFIG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/config.postcard"));

/// Heap for the radio driver, JSON payloads and MQTT requests
const HEAP_SIZE: usize = 72 * 1024;

/// DHCP, DNS, MQTT and SNTP sockets
const SOCKET_COUNT: usize = 4;

pub type SensorBus = I2c<'static, Async>;

pub type TelemetryNode =
    Node<'static, EspRadio, BrokerClient, Ina226<SensorBus>, NoEnvironmentalSensor>;

/// The node lock shared by every timer task
pub type NodeMutex = Mutex<CriticalSectionRawMutex, TelemetryNode>;

static CONFIG_SET: StaticCell<ConfigSet> = StaticCell::new();
static STACK_RESOURCES: StaticCell<StackResources<SOCKET_COUNT>> = StaticCell::new();
static NODE: StaticCell<NodeMutex> = StaticCell::new();

/// Main entry point
#[esp_rtos::main]
async fn main(spawner: Spawner) {
    rtt_target::rtt_init_defmt!();
    info!("Telenode firmware starting...");

    let peripherals = esp_hal::init(esp_hal::Config::default().with_cpu_clock(CpuClock::max()));
    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: HEAP_SIZE);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_interrupt = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_interrupt.software_interrupt0);

    let set = match postcard::from_bytes::<ConfigSet>(EMBEDDED_CONFIG) {
        Ok(set) => CONFIG_SET.init(set),
        Err(e) => defmt::panic!("embedded configuration unreadable: {}", Debug2Format(&e)),
    };

    let radio_init = match esp_radio::init() {
        Ok(init) => Box::leak(Box::new(init)),
        Err(e) => defmt::panic!("esp_radio init failed: {:?}", e),
    };
    let (controller, interfaces) =
        match esp_radio::wifi::new(radio_init, peripherals.WIFI, Default::default()) {
            Ok(parts) => parts,
            Err(e) => defmt::panic!("wifi initialization failed: {:?}", e),
        };
    let mac = interfaces.sta.mac_address();

    let config: &'static NodeConfig = set.select(&mac);
    let identity = Identity::new(config, mac);
    info!(
        "Device {=str}, {=usize} device override(s) embedded",
        identity.client_id.as_str(),
        set.devices.len()
    );

    if config.safety.enable_watchdog {
        let timg1 = TimerGroup::new(peripherals.TIMG1);
        board::install_watchdog(timg1.wdt, config.safety.watchdog_timeout_ms);
    }

    let mut dhcp = DhcpConfig::default();
    let mut hostname = heapless::String::new();
    for c in identity.hostname.chars() {
        if hostname.push(c).is_err() {
            break;
        }
    }
    dhcp.hostname = Some(hostname);

    let rng = Rng::new();
    let seed = u64::from(rng.random()) << 32 | u64::from(rng.random());
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        embassy_net::Config::dhcpv4(dhcp),
        STACK_RESOURCES.init(StackResources::new()),
        seed,
    );
    unwrap!(spawner.spawn(radio::net_task(runner)));
    unwrap!(spawner.spawn(mqtt::mqtt_task(stack)));
    unwrap!(spawner.spawn(sntp::sntp_task(stack)));

    let electrical = match &config.ina226 {
        Some(ina) => setup_ina226(
            ina,
            I2c::new(peripherals.I2C0, I2cConfig::default().with_frequency(Rate::from_khz(400)))
                .ok()
                .map(|i2c| {
                    i2c.with_sda(peripherals.GPIO8)
                        .with_scl(peripherals.GPIO9)
                        .into_async()
                }),
        )
        .await,
        None => None,
    };

    let mut board = Board;
    let supervisor = match Supervisor::new(
        config,
        EspRadio::new(controller, stack, mac),
        BrokerClient,
        board.now_ms(),
    ) {
        Ok(supervisor) => supervisor,
        Err(e) => defmt::panic!("topic configuration rejected: {}", Debug2Format(&e)),
    };
    let node = match Node::new(supervisor, electrical, core::iter::empty::<NoEnvironmentalSensor>()) {
        Ok(node) => NODE.init(Mutex::new(node)),
        Err(e) => defmt::panic!("sensor configuration rejected: {}", Debug2Format(&e)),
    };

    // First reading goes out unconditionally
    if let Err(e) = measure_now(node, &mut board, SendTrigger::FORCED.to_arg()).await {
        warn!("startup measurement failed: {:?}", e);
    }

    let telemetry = &config.telemetry;
    unwrap!(spawner.spawn(tasks::measure_task(
        node,
        telemetry.measure_interval_ms,
        SendTrigger::for_tick(telemetry.send_forced_always),
    )));
    unwrap!(spawner.spawn(tasks::check_msgs_task(node, telemetry.check_interval_ms)));
    if config.safety.restart_after_s > 0 {
        unwrap!(spawner.spawn(tasks::reboot_task(node, config.safety.restart_after_s)));
    }

    info!("All tasks spawned");
}

/// Calibrate and start continuous conversions
///
/// A missing or unresponsive monitor disables the electrical channel
/// instead of stopping the node.
async fn setup_ina226(
    ina: &Ina226Config,
    bus: Option<SensorBus>,
) -> Option<Ina226<SensorBus>> {
    let Some(mut bus) = bus else {
        error!("I2C bus configuration rejected");
        return None;
    };

    let found = I2cBus::scan(&mut bus).await;
    for address in found.iter() {
        debug!("I2C device at {=u8:#x}", address);
    }
    if !found.contains(ina.address) {
        error!("no INA226 answering at {=u8:#x}", ina.address);
        return None;
    }

    let mut sensor = match Ina226::new(bus, ina.address, ina.shunt_ohms, ina.max_expected_amps) {
        Ok(sensor) => sensor,
        Err(e) => {
            error!("INA226 calibration impossible: {:?}", Debug2Format(&e));
            return None;
        }
    };

    let averaging = Averaging::from_code(ina.averaging).unwrap_or_default();
    let bus_ct = ConversionTime::from_code(ina.bus_conversion).unwrap_or_default();
    let shunt_ct = ConversionTime::from_code(ina.shunt_conversion).unwrap_or_default();
    match sensor.configure(averaging, bus_ct, shunt_ct).await {
        Ok(()) => {
            let cal = sensor.calibration();
            info!(
                "INA226 at {=u8:#x}: calibration {=u16}, config {=u16:#x}",
                ina.address,
                cal.calibration_register,
                sensor.config()
            );
            Some(sensor)
        }
        Err(e) => {
            error!("INA226 setup failed: {:?}", Debug2Format(&e));
            None
        }
    }
}
