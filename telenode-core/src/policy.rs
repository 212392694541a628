//! Send policy
//!
//! Decides, per sample, whether a reading is forced, overdue, or different
//! enough from the last sent sample to be worth a transmission.
//!
//! ```text
//! overdue   = no history || now - last.at > period
//! threshold = min(|previous| * 0.1, cap)
//! changed   = history && |current - previous| > threshold   (any tracked field)
//! send      = forced || (enabled && overdue) || changed
//! ```

use crate::sample::{Sample, TrackedField};
use crate::Millis;

/// Argument bit: send regardless of history
pub const FORCED_BIT: u8 = 0b10;

/// Argument bit: periodic (overdue) sends allowed
pub const ENABLED_BIT: u8 = 0b01;

/// Relative change threshold before the cap applies
pub const RELATIVE_THRESHOLD: f32 = 0.1;

/// Trigger flags of one scheduler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SendTrigger {
    pub forced: bool,
    pub enabled: bool,
}

impl SendTrigger {
    /// Regular timer tick
    pub const PERIODIC: Self = Self {
        forced: false,
        enabled: true,
    };

    /// Unconditional send
    pub const FORCED: Self = Self {
        forced: true,
        enabled: true,
    };

    /// Decode the scheduler argument bitmask
    ///
    /// Each bit is tested with AND. Decoding with XOR against the mask
    /// would report a flag as set exactly when its bit is clear.
    pub const fn from_arg(arg: u8) -> Self {
        Self {
            forced: arg & FORCED_BIT != 0,
            enabled: arg & ENABLED_BIT != 0,
        }
    }

    /// Timer tick trigger; `send_forced_always` makes every tick forced
    pub const fn for_tick(send_forced_always: bool) -> Self {
        if send_forced_always {
            Self::FORCED
        } else {
            Self::PERIODIC
        }
    }

    /// Encode back into the argument bitmask
    pub const fn to_arg(self) -> u8 {
        (if self.forced { FORCED_BIT } else { 0 }) | (if self.enabled { ENABLED_BIT } else { 0 })
    }
}

/// Last sample handed to the publisher for one channel
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LastSent {
    pub sample: Sample,
    /// When the publish was attempted
    pub at: Millis,
}

/// Why a sample is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendReason {
    Forced,
    Overdue,
    Changed(TrackedField),
}

/// Outcome of [`decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Decision {
    pub send: bool,
    pub overdue: bool,
    /// First tracked field over its threshold
    pub changed: Option<TrackedField>,
    pub reason: Option<SendReason>,
}

fn abs(x: f32) -> f32 {
    if x < 0.0 {
        -x
    } else {
        x
    }
}

/// Change threshold for a field whose previous value was `previous`
pub fn threshold(previous: f32, cap: f32) -> f32 {
    (abs(previous) * RELATIVE_THRESHOLD).min(cap)
}

/// Strictly greater than the threshold; equal is not a change
pub fn exceeds_threshold(current: f32, previous: f32, cap: f32) -> bool {
    abs(current - previous) > threshold(previous, cap)
}

/// True when the last send is older than `period_ms`, or there is none
pub fn is_overdue(last: Option<&LastSent>, now: Millis, period_ms: Millis) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_sub(last.at) > period_ms,
    }
}

/// First tracked field of `sample` that moved past its threshold
pub fn changed_field(sample: &Sample, last: Option<&LastSent>) -> Option<TrackedField> {
    let previous = &last?.sample.reading;
    if !sample.reading.same_kind(previous) {
        return None;
    }
    sample.reading.tracked_fields().iter().copied().find(|field| {
        match (sample.reading.field(*field), previous.field(*field)) {
            (Some(v), Some(p)) => exceeds_threshold(v, p, field.cap()),
            _ => false,
        }
    })
}

/// Decide whether `sample` is sent
pub fn decide(
    sample: &Sample,
    last: Option<&LastSent>,
    now: Millis,
    period_ms: Millis,
    trigger: SendTrigger,
) -> Decision {
    let overdue = is_overdue(last, now, period_ms);
    let changed = changed_field(sample, last);

    let reason = if trigger.forced {
        Some(SendReason::Forced)
    } else if trigger.enabled && overdue {
        Some(SendReason::Overdue)
    } else {
        changed.map(SendReason::Changed)
    };

    Decision {
        send: reason.is_some(),
        overdue,
        changed,
        reason,
    }
}
