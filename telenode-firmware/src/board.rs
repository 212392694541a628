//! ESP32-C3 platform capabilities
//!
//! Every task owns a [`Board`] handle. The hardware watchdog and the
//! wall-clock offset are shared behind critical-section mutexes.

use core::cell::{Cell, RefCell};

use defmt::*;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Delay, Instant, Timer};
use embedded_hal_async::delay::DelayNs;
use esp_hal::peripherals::TIMG1;
use esp_hal::time::Duration;
use esp_hal::timer::timg::{MwdtStage, Wdt};

use telenode_core::traits::{Clock, Restart, Watchdog};
use telenode_core::Millis;

type HardwareWatchdog = Wdt<TIMG1<'static>>;

/// Hardware watchdog, installed once at boot
static WATCHDOG: Mutex<CriticalSectionRawMutex, RefCell<Option<HardwareWatchdog>>> =
    Mutex::new(RefCell::new(None));

/// UNIX seconds at boot, once SNTP has answered
static UNIX_AT_BOOT: Mutex<CriticalSectionRawMutex, Cell<Option<i64>>> =
    Mutex::new(Cell::new(None));

/// Arm the watchdog with the configured timeout
pub fn install_watchdog(mut wdt: HardwareWatchdog, timeout_ms: u32) {
    wdt.set_timeout(MwdtStage::Stage0, Duration::from_millis(u64::from(timeout_ms)));
    wdt.enable();
    wdt.feed();
    WATCHDOG.lock(|cell| cell.replace(Some(wdt)));
    info!("watchdog armed, {=u32} ms", timeout_ms);
}

/// Record wall-clock time from an SNTP reply
pub fn set_unix_time(unix_secs: i64) {
    let boot = unix_secs - (Instant::now().as_secs() as i64);
    UNIX_AT_BOOT.lock(|cell| cell.set(Some(boot)));
}

/// Capability handle passed to the scheduler and supervisor
#[derive(Debug, Clone, Copy, Default)]
pub struct Board;

impl Watchdog for Board {
    fn feed(&mut self) {
        WATCHDOG.lock(|cell| {
            if let Some(wdt) = cell.borrow_mut().as_mut() {
                wdt.feed();
            }
        });
    }
}

impl Restart for Board {
    fn restart(&mut self) {
        warn!("software reset");
        esp_hal::system::software_reset()
    }
}

impl Clock for Board {
    fn now_ms(&self) -> Millis {
        Instant::now().as_millis()
    }

    fn unix_time(&self) -> Option<i64> {
        UNIX_AT_BOOT
            .lock(|cell| cell.get())
            .map(|boot| boot + Instant::now().as_secs() as i64)
    }
}

impl DelayNs for Board {
    async fn delay_ns(&mut self, ns: u32) {
        Delay.delay_ns(ns).await;
    }

    async fn delay_ms(&mut self, ms: u32) {
        Timer::after_millis(u64::from(ms)).await;
    }
}
