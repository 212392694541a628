//! Telenode Hardware Abstraction Layer
//!
//! This crate defines the bus abstraction shared by the sensor drivers and
//! the firmware. Chip HALs plug in through `embedded-hal-async`, so any
//! async I2C master works without an adapter.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  telenode-drivers (INA226, ...)         │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  telenode-hal (this crate - traits)     │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  embedded-hal-async I2c (esp-hal, ...)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Traits
//!
//! - [`i2c::I2cBus`] - I2C bus operations and 16-bit register access

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

pub mod i2c;

pub use i2c::{I2cBus, ScanResult};
