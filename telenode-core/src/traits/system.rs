//! Watchdog, clock and restart capabilities

use embedded_hal_async::delay::DelayNs;

use crate::Millis;

/// Longest sleep between two watchdog feeds in [`delay_fed`]
pub const FEED_SLICE_MS: u32 = 1_000;

/// Hardware watchdog
pub trait Watchdog {
    /// Reset the watchdog countdown
    fn feed(&mut self);
}

impl<W: Watchdog> Watchdog for Option<W> {
    fn feed(&mut self) {
        if let Some(wdt) = self {
            wdt.feed();
        }
    }
}

/// Watchdog stand-in when the hardware watchdog is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn feed(&mut self) {}
}

/// Full device restart
///
/// On hardware this does not return. Implementations used in tests record
/// the request and return, so callers must stop work after calling it.
pub trait Restart {
    fn restart(&mut self);
}

/// Time sources
pub trait Clock {
    /// Monotonic milliseconds since boot
    fn now_ms(&self) -> Millis;

    /// Wall-clock UNIX seconds, once synchronised
    fn unix_time(&self) -> Option<i64>;
}

/// Everything the supervisor and scheduler need from the board
pub trait Platform: Watchdog + Restart + Clock + DelayNs {}

impl<T: Watchdog + Restart + Clock + DelayNs> Platform for T {}

/// Sleep `ms`, feeding the watchdog at least every [`FEED_SLICE_MS`]
pub async fn delay_fed<P: Watchdog + DelayNs>(p: &mut P, ms: u32) {
    let mut remaining = ms;
    loop {
        p.feed();
        if remaining == 0 {
            break;
        }
        let slice = remaining.min(FEED_SLICE_MS);
        p.delay_ms(slice).await;
        remaining -= slice;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;

    #[test]
    fn test_option_watchdog() {
        struct Counter(u32);
        impl Watchdog for Counter {
            fn feed(&mut self) {
                self.0 += 1;
            }
        }

        let mut none: Option<Counter> = None;
        none.feed();

        let mut some = Some(Counter(0));
        some.feed();
        some.feed();
        assert_eq!(some.map(|c| c.0), Some(2));
    }

    #[test]
    fn test_delay_fed_slices() {
        let mut p = FakePlatform::new();
        embassy_futures::block_on(delay_fed(&mut p, 2_500));

        assert_eq!(p.now_ms(), 2_500);
        assert_eq!(p.delays, std::vec![1_000, 1_000, 500]);
        assert_eq!(p.feeds, 4);
    }
}
