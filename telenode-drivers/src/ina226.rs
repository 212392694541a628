//! INA226 current/power monitor (I2C)
//!
//! The INA226 measures the voltage across a shunt resistor and the bus
//! voltage, and computes current and power from a calibration value
//! programmed by the host.
//!
//! # Register Protocol
//!
//! All registers are 16 bits wide, big-endian on the wire:
//! - Write: `[register, hi, lo]`
//! - Read: write `[register]`, repeated start, read `[hi, lo]`
//!
//! Shunt voltage and current are two's complement; bus voltage and power
//! are unsigned.
//!
//! # Calibration
//!
//! ```text
//! max_possible   = gain / shunt
//! current_lsb    = min(max_expected, max_possible) / 32768   (floored to the device minimum)
//! power_lsb      = current_lsb * 25.2
//! calibration    = trunc(0.00512 / (current_lsb * shunt))
//! ```
//!
//! The arithmetic is carried out in `f64` so the register value matches
//! what other hosts compute for the same shunt.

use telenode_core::sample::ElectricalReading;
use telenode_core::traits::{ElectricalSensor, SensorError};
use telenode_hal::I2cBus;

/// INA226 register addresses
pub mod reg {
    /// Configuration
    pub const CONFIG: u8 = 0x00;
    /// Shunt voltage
    pub const SHUNT_VOLTAGE: u8 = 0x01;
    /// Bus voltage
    pub const BUS_VOLTAGE: u8 = 0x02;
    /// Power
    pub const POWER: u8 = 0x03;
    /// Current
    pub const CURRENT: u8 = 0x04;
    /// Calibration
    pub const CALIBRATION: u8 = 0x05;
    /// Mask/enable (alert configuration and status flags)
    pub const MASK_ENABLE: u8 = 0x06;
    /// Alert limit
    pub const ALERT_LIMIT: u8 = 0x07;
    /// Manufacturer ID
    pub const MANUFACTURER_ID: u8 = 0xFE;
    /// Die ID
    pub const DIE_ID: u8 = 0xFF;
}

/// Mask/enable register bits
pub mod mask {
    /// Alert latch: the alert stays set until the register is read
    pub const LEN: u16 = 1 << 0;
    /// Alert polarity: active high
    pub const APOL: u16 = 1 << 1;
    /// Math overflow: current and power are invalid
    pub const OVF: u16 = 1 << 2;
    /// Conversion ready
    pub const CVRF: u16 = 1 << 3;
    /// Alert function flag
    pub const AFF: u16 = 1 << 4;
    /// Alert on bus voltage under limit
    pub const BUL: u16 = 1 << 12;
}

/// Default 7-bit address (A0 = A1 = GND)
pub const DEFAULT_ADDRESS: u8 = 0x40;

/// Internal scaling constant of the calibration equation
pub const CALIBRATION_FACTOR: f64 = 0.00512;

/// Full-scale bus voltage
pub const BUS_RANGE_VOLTS: f64 = 40.96;

/// Full-scale shunt voltage
pub const GAIN_VOLTS: f64 = 0.08192;

/// Shunt voltage register LSB in mV
pub const SHUNT_MILLIVOLTS_LSB: f64 = 0.0025;

/// Bus voltage register LSB in mV
pub const BUS_MILLIVOLTS_LSB: f64 = 1.25;

/// Power LSB as a multiple of the current LSB
pub const POWER_LSB_RATIO: f64 = 25.2;

const CURRENT_LSB_FACTOR: f64 = 32768.0;
const MAX_CALIBRATION_VALUE: f64 = 32767.0;

/// Manufacturer ID of Texas Instruments parts ("TI")
pub const TI_MANUFACTURER_ID: u16 = 0x5449;

/// Operating mode bits of the configuration register
const MODE_MASK: u16 = 0b111;
/// Shunt and bus, continuous
const MODE_SHUNT_BUS_CONTINUOUS: u16 = 0b111;
/// Bit 14 reads back as one
const CONFIG_FIXED_BIT: u16 = 1 << 14;
/// Software reset
const CONFIG_RESET: u16 = 1 << 15;

/// Samples averaged per conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Averaging {
    Avg1 = 0,
    Avg4 = 1,
    #[default]
    Avg16 = 2,
    Avg64 = 3,
    Avg128 = 4,
    Avg256 = 5,
    Avg512 = 6,
    Avg1024 = 7,
}

impl Averaging {
    /// Decode the 3-bit register field
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Averaging::Avg1,
            1 => Averaging::Avg4,
            2 => Averaging::Avg16,
            3 => Averaging::Avg64,
            4 => Averaging::Avg128,
            5 => Averaging::Avg256,
            6 => Averaging::Avg512,
            7 => Averaging::Avg1024,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Number of samples averaged
    pub fn samples(self) -> u16 {
        match self {
            Averaging::Avg1 => 1,
            Averaging::Avg4 => 4,
            Averaging::Avg16 => 16,
            Averaging::Avg64 => 64,
            Averaging::Avg128 => 128,
            Averaging::Avg256 => 256,
            Averaging::Avg512 => 512,
            Averaging::Avg1024 => 1024,
        }
    }
}

/// Conversion time of one bus or shunt sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConversionTime {
    Us140 = 0,
    Us204 = 1,
    Us332 = 2,
    Us588 = 3,
    Us1100 = 4,
    Us2116 = 5,
    Us4156 = 6,
    #[default]
    Us8244 = 7,
}

impl ConversionTime {
    /// Decode the 3-bit register field
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ConversionTime::Us140,
            1 => ConversionTime::Us204,
            2 => ConversionTime::Us332,
            3 => ConversionTime::Us588,
            4 => ConversionTime::Us1100,
            5 => ConversionTime::Us2116,
            6 => ConversionTime::Us4156,
            7 => ConversionTime::Us8244,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn micros(self) -> u32 {
        match self {
            ConversionTime::Us140 => 140,
            ConversionTime::Us204 => 204,
            ConversionTime::Us332 => 332,
            ConversionTime::Us588 => 588,
            ConversionTime::Us1100 => 1_100,
            ConversionTime::Us2116 => 2_116,
            ConversionTime::Us4156 => 4_156,
            ConversionTime::Us8244 => 8_244,
        }
    }
}

/// Pack the configuration register for continuous shunt and bus conversion
pub fn config_word(averaging: Averaging, bus: ConversionTime, shunt: ConversionTime) -> u16 {
    CONFIG_FIXED_BIT
        | u16::from(averaging.code()) << 9
        | u16::from(bus.code()) << 6
        | u16::from(shunt.code()) << 3
        | MODE_SHUNT_BUS_CONTINUOUS
}

/// INA226 errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ina226Error<E> {
    /// Register I/O failed
    Bus(E),
    /// The device flagged its current/power result as invalid
    RangeOverflow,
    /// The requested calibration cannot be represented
    Configuration,
}

impl<E> From<Ina226Error<E>> for SensorError {
    fn from(e: Ina226Error<E>) -> Self {
        match e {
            Ina226Error::Bus(_) => SensorError::Bus,
            Ina226Error::RangeOverflow => SensorError::RangeOverflow,
            Ina226Error::Configuration => SensorError::Configuration,
        }
    }
}

/// Interpret a register as two's complement
pub fn to_signed(raw: u16) -> i32 {
    if raw > 32767 {
        i32::from(raw) - 65536
    } else {
        i32::from(raw)
    }
}

/// Encode a signed value as its two's complement register pattern
pub fn from_signed(value: i32) -> u16 {
    if value < 0 {
        (value + 65536) as u16
    } else {
        value as u16
    }
}

/// Round a non-negative value to three decimals
fn round_milli(x: f64) -> f64 {
    ((x * 1000.0 + 0.5) as u64) as f64 / 1000.0
}

/// Derived calibration, fixed once computed
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationParameters {
    pub shunt_ohms: f64,
    pub max_expected_amps: Option<f64>,
    pub bus_range_volts: f64,
    pub gain_volts: f64,
    /// Amps per current register LSB
    pub current_lsb: f64,
    /// Watts per power register LSB
    pub power_lsb: f64,
    pub calibration_register: u16,
}

impl CalibrationParameters {
    /// Smallest current LSB the calibration register can express
    pub fn min_current_lsb(shunt_ohms: f64) -> f64 {
        CALIBRATION_FACTOR / (shunt_ohms * MAX_CALIBRATION_VALUE)
    }

    /// Compute the calibration for a shunt and expected current range
    ///
    /// Fails with [`Ina226Error::Configuration`] when the shunt is not
    /// positive or `max_expected_amps` exceeds what the shunt can measure.
    /// A zero or negative `max_expected_amps` yields the smallest LSB.
    pub fn calculate<E>(
        shunt_ohms: f64,
        bus_range_volts: f64,
        gain_volts: f64,
        max_expected_amps: Option<f64>,
    ) -> Result<Self, Ina226Error<E>> {
        if !(shunt_ohms > 0.0) {
            return Err(Ina226Error::Configuration);
        }
        let max_possible_amps = gain_volts / shunt_ohms;

        let mut current_lsb = match max_expected_amps {
            Some(expected) => {
                if expected > round_milli(max_possible_amps) {
                    return Err(Ina226Error::Configuration);
                }
                if expected < max_possible_amps {
                    expected / CURRENT_LSB_FACTOR
                } else {
                    max_possible_amps / CURRENT_LSB_FACTOR
                }
            }
            None => max_possible_amps / CURRENT_LSB_FACTOR,
        };

        let min_lsb = Self::min_current_lsb(shunt_ohms);
        if current_lsb < min_lsb {
            current_lsb = min_lsb;
        }

        let power_lsb = current_lsb * POWER_LSB_RATIO;
        let calibration = CALIBRATION_FACTOR / (current_lsb * shunt_ohms);
        if !(calibration >= 1.0 && calibration < 65536.0) {
            return Err(Ina226Error::Configuration);
        }

        Ok(Self {
            shunt_ohms,
            max_expected_amps,
            bus_range_volts,
            gain_volts,
            current_lsb,
            power_lsb,
            calibration_register: calibration as u16,
        })
    }
}

/// INA226 driver
pub struct Ina226<B> {
    bus: B,
    address: u8,
    calibration: CalibrationParameters,
    config: u16,
}

impl<B: I2cBus> Ina226<B> {
    /// Create a driver; nothing is written until [`Self::configure`]
    ///
    /// The calibration is computed here so that an impossible range is
    /// reported before the device is touched.
    pub fn new(
        bus: B,
        address: u8,
        shunt_ohms: f64,
        max_expected_amps: Option<f64>,
    ) -> Result<Self, Ina226Error<B::Error>> {
        let calibration = CalibrationParameters::calculate(
            shunt_ohms,
            BUS_RANGE_VOLTS,
            GAIN_VOLTS,
            max_expected_amps,
        )?;
        Ok(Self {
            bus,
            address,
            calibration,
            config: config_word(
                Averaging::Avg1,
                ConversionTime::Us1100,
                ConversionTime::Us1100,
            ),
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn calibration(&self) -> &CalibrationParameters {
        &self.calibration
    }

    /// Release the bus
    pub fn release(self) -> B {
        self.bus
    }

    /// Calibrate, then start continuous shunt and bus conversions
    pub async fn configure(
        &mut self,
        averaging: Averaging,
        bus_conversion: ConversionTime,
        shunt_conversion: ConversionTime,
    ) -> Result<(), Ina226Error<B::Error>> {
        self.calibrate(BUS_RANGE_VOLTS, GAIN_VOLTS, self.calibration.max_expected_amps)
            .await?;
        let word = config_word(averaging, bus_conversion, shunt_conversion);
        self.write(reg::CONFIG, word).await?;
        self.config = word;
        Ok(())
    }

    /// Recompute the calibration and write it to the device
    pub async fn calibrate(
        &mut self,
        bus_range_volts: f64,
        gain_volts: f64,
        max_expected_amps: Option<f64>,
    ) -> Result<(), Ina226Error<B::Error>> {
        let calibration = CalibrationParameters::calculate(
            self.calibration.shunt_ohms,
            bus_range_volts,
            gain_volts,
            max_expected_amps,
        )?;
        self.write(reg::CALIBRATION, calibration.calibration_register)
            .await?;
        self.calibration = calibration;
        Ok(())
    }

    async fn read(&mut self, register: u8) -> Result<u16, Ina226Error<B::Error>> {
        self.bus
            .read_register(self.address, register)
            .await
            .map_err(Ina226Error::Bus)
    }

    async fn write(&mut self, register: u8, value: u16) -> Result<(), Ina226Error<B::Error>> {
        self.bus
            .write_register(self.address, register, value)
            .await
            .map_err(Ina226Error::Bus)
    }

    /// Math overflow flag; reading clears the conversion-ready flag
    pub async fn has_overflow(&mut self) -> Result<bool, Ina226Error<B::Error>> {
        Ok(self.read(reg::MASK_ENABLE).await? & mask::OVF != 0)
    }

    /// A conversion finished since the mask register was last read
    pub async fn is_conversion_ready(&mut self) -> Result<bool, Ina226Error<B::Error>> {
        Ok(self.read(reg::MASK_ENABLE).await? & mask::CVRF != 0)
    }

    async fn check_overflow(&mut self) -> Result<(), Ina226Error<B::Error>> {
        if self.has_overflow().await? {
            return Err(Ina226Error::RangeOverflow);
        }
        Ok(())
    }

    async fn raw_current(&mut self) -> Result<f64, Ina226Error<B::Error>> {
        let raw = to_signed(self.read(reg::CURRENT).await?);
        Ok(f64::from(raw) * self.calibration.current_lsb * 1000.0)
    }

    async fn raw_voltage(&mut self) -> Result<f64, Ina226Error<B::Error>> {
        let raw = self.read(reg::BUS_VOLTAGE).await?;
        Ok(f64::from(raw) * BUS_MILLIVOLTS_LSB / 1000.0)
    }

    async fn raw_shunt_voltage(&mut self) -> Result<f64, Ina226Error<B::Error>> {
        let raw = to_signed(self.read(reg::SHUNT_VOLTAGE).await?);
        Ok(f64::from(raw) * SHUNT_MILLIVOLTS_LSB)
    }

    async fn raw_power(&mut self) -> Result<f64, Ina226Error<B::Error>> {
        let raw = self.read(reg::POWER).await?;
        Ok(f64::from(raw) * self.calibration.power_lsb * 1000.0)
    }

    /// Bus current in mA
    pub async fn current(&mut self) -> Result<f64, Ina226Error<B::Error>> {
        self.check_overflow().await?;
        self.raw_current().await
    }

    /// Bus voltage in V
    pub async fn voltage(&mut self) -> Result<f64, Ina226Error<B::Error>> {
        self.check_overflow().await?;
        self.raw_voltage().await
    }

    /// Shunt voltage in mV
    pub async fn shunt_voltage(&mut self) -> Result<f64, Ina226Error<B::Error>> {
        self.check_overflow().await?;
        self.raw_shunt_voltage().await
    }

    /// Power in mW
    pub async fn power(&mut self) -> Result<f64, Ina226Error<B::Error>> {
        self.check_overflow().await?;
        self.raw_power().await
    }

    /// Supply-side voltage (bus plus shunt drop) in V
    pub async fn supply_voltage(&mut self) -> Result<f64, Ina226Error<B::Error>> {
        self.check_overflow().await?;
        let bus = self.raw_voltage().await?;
        let shunt = self.raw_shunt_voltage().await?;
        Ok(bus + shunt / 1000.0)
    }

    /// Every quantity of the latest conversion, with one overflow check
    pub async fn read_all(&mut self) -> Result<ElectricalReading, Ina226Error<B::Error>> {
        self.check_overflow().await?;
        let current = self.raw_current().await?;
        let bus = self.raw_voltage().await?;
        let shunt = self.raw_shunt_voltage().await?;
        let power = self.raw_power().await?;
        Ok(ElectricalReading {
            current_ma: current as f32,
            bus_voltage_v: bus as f32,
            shunt_voltage_mv: shunt as f32,
            supply_voltage_v: (bus + shunt / 1000.0) as f32,
            power_mw: power as f32,
        })
    }

    /// Stop conversions, keeping the rest of the configuration
    pub async fn sleep(&mut self) -> Result<(), Ina226Error<B::Error>> {
        let config = self.read(reg::CONFIG).await?;
        self.write(reg::CONFIG, config & !MODE_MASK).await
    }

    /// Resume continuous shunt and bus conversions
    pub async fn wake(&mut self) -> Result<(), Ina226Error<B::Error>> {
        let config = self.read(reg::CONFIG).await?;
        let word = config | MODE_SHUNT_BUS_CONTINUOUS;
        self.write(reg::CONFIG, word).await?;
        self.config = word;
        Ok(())
    }

    /// Reset every register to its power-on default
    ///
    /// The calibration register is cleared too; call [`Self::configure`]
    /// afterwards.
    pub async fn reset(&mut self) -> Result<(), Ina226Error<B::Error>> {
        self.write(reg::CONFIG, CONFIG_RESET).await
    }

    /// Raise the alert pin when the bus voltage drops below `threshold_volts`
    ///
    /// The alert is latched and cleared by [`Self::is_low_battery`].
    pub async fn set_low_battery(
        &mut self,
        threshold_volts: f64,
        active_high: bool,
    ) -> Result<(), Ina226Error<B::Error>> {
        if !(threshold_volts >= 0.0 && threshold_volts <= BUS_RANGE_VOLTS) {
            return Err(Ina226Error::Configuration);
        }
        let limit = (threshold_volts * 1000.0 / BUS_MILLIVOLTS_LSB) as u16;
        self.write(reg::ALERT_LIMIT, limit).await?;

        let mut enable = mask::BUL | mask::LEN;
        if active_high {
            enable |= mask::APOL;
        }
        self.write(reg::MASK_ENABLE, enable).await
    }

    /// The bus-under-limit alert fired since the last check
    ///
    /// Tests the alert function flag; the BUL bit only says the alert is
    /// armed.
    pub async fn is_low_battery(&mut self) -> Result<bool, Ina226Error<B::Error>> {
        Ok(self.read(reg::MASK_ENABLE).await? & mask::AFF != 0)
    }

    pub async fn manufacturer_id(&mut self) -> Result<u16, Ina226Error<B::Error>> {
        self.read(reg::MANUFACTURER_ID).await
    }

    pub async fn die_id(&mut self) -> Result<u16, Ina226Error<B::Error>> {
        self.read(reg::DIE_ID).await
    }

    /// Last configuration word written
    pub fn config(&self) -> u16 {
        self.config
    }
}

impl<B: I2cBus> ElectricalSensor for Ina226<B> {
    async fn is_conversion_ready(&mut self) -> Result<bool, SensorError> {
        Ok(Ina226::is_conversion_ready(self).await?)
    }

    async fn read(&mut self) -> Result<ElectricalReading, SensorError> {
        Ok(self.read_all().await?)
    }
}
