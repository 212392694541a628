//! Sensor driver implementations
//!
//! This crate provides concrete implementations of the sensor traits
//! defined in telenode-core:
//!
//! - Current/power monitor (INA226)

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

pub mod ina226;

pub use ina226::{Averaging, CalibrationParameters, ConversionTime, Ina226, Ina226Error};
