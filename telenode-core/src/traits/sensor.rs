//! Sensor capabilities

use crate::sample::ElectricalReading;

/// Sensor failures as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// Register I/O failed
    Bus,
    /// The device flagged its current/power result as invalid
    RangeOverflow,
    /// The requested calibration cannot be represented
    Configuration,
    /// No fresh conversion within the poll budget
    NotReady,
    /// Corrupt frame (checksum, framing)
    Checksum,
}

/// Current/power monitor
#[allow(async_fn_in_trait)]
pub trait ElectricalSensor {
    /// A new conversion is available
    async fn is_conversion_ready(&mut self) -> Result<bool, SensorError>;

    /// Read every quantity of the latest conversion
    async fn read(&mut self) -> Result<ElectricalReading, SensorError>;
}

/// Temperature/humidity sensor
#[allow(async_fn_in_trait)]
pub trait EnvironmentalSensor {
    /// Measure `(temperature °C, relative humidity %)`
    async fn measure(&mut self) -> Result<(f32, f32), SensorError>;
}

/// Placeholder type for boards without an environmental sensor
#[derive(Debug)]
pub enum NoEnvironmentalSensor {}

impl EnvironmentalSensor for NoEnvironmentalSensor {
    async fn measure(&mut self) -> Result<(f32, f32), SensorError> {
        match *self {}
    }
}
