//! Board-agnostic core logic for the sensor node firmware
//!
//! This crate contains all application logic that does not depend on
//! specific hardware implementations:
//!
//! - Capability traits (radio, pub/sub client, sensors, watchdog, clock)
//! - Sample model and the send-decision policy
//! - Connectivity supervisor (link + session, restart on failure)
//! - Telemetry scheduler and the command channel
//! - Payload formatting and civil time
//! - Configuration type definitions

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod commands;
pub mod config;
pub mod payload;
pub mod policy;
pub mod sample;
pub mod scheduler;
pub mod supervisor;
pub mod time;
pub mod traits;

#[cfg(test)]
mod testing;

/// Milliseconds on the node's monotonic clock
pub type Millis = u64;
