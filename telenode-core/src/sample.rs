//! Sample model
//!
//! A sample is an immutable snapshot of one sensor channel. Electrical and
//! environmental readings share one scheduling contract: each kind names
//! the fields whose change is worth a transmission, together with the cap
//! on the change threshold for that field.

use heapless::String;
use serde::Serialize;

use crate::config::MAX_LABEL_LEN;
use crate::Millis;

/// Reading of the current/power monitor
///
/// Serializes with the key names the telemetry receivers expect.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ElectricalReading {
    /// Bus current in mA
    #[serde(rename = "current")]
    pub current_ma: f32,
    /// Bus voltage in V
    #[serde(rename = "busvoltage")]
    pub bus_voltage_v: f32,
    /// Shunt voltage in mV
    #[serde(rename = "shuntvoltage")]
    pub shunt_voltage_mv: f32,
    /// Supply voltage (bus + shunt) in V
    #[serde(rename = "supplyvoltage")]
    pub supply_voltage_v: f32,
    /// Power in mW
    #[serde(rename = "power")]
    pub power_mw: f32,
}

/// Reading of a temperature/humidity sensor
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EnvironmentalReading {
    /// Temperature in °C
    pub temperature: f32,
    /// Relative humidity in %
    pub humidity: f32,
    /// Channel that produced the reading
    pub measure_device_name: String<MAX_LABEL_LEN>,
}

/// Reading of either kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(untagged)]
pub enum Reading {
    Electrical(ElectricalReading),
    Environmental(EnvironmentalReading),
}

/// Field compared against the last sent sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrackedField {
    Current,
    BusVoltage,
    Temperature,
    Humidity,
}

impl TrackedField {
    /// Upper bound on the change threshold
    pub const fn cap(self) -> f32 {
        match self {
            TrackedField::Current => 1.0,
            TrackedField::BusVoltage => 0.32,
            TrackedField::Humidity => 1.0,
            TrackedField::Temperature => 0.1,
        }
    }
}

const ELECTRICAL_FIELDS: [TrackedField; 2] = [TrackedField::Current, TrackedField::BusVoltage];
const ENVIRONMENTAL_FIELDS: [TrackedField; 2] =
    [TrackedField::Humidity, TrackedField::Temperature];

impl Reading {
    /// Fields whose change may trigger a send
    pub fn tracked_fields(&self) -> &'static [TrackedField] {
        match self {
            Reading::Electrical(_) => &ELECTRICAL_FIELDS,
            Reading::Environmental(_) => &ENVIRONMENTAL_FIELDS,
        }
    }

    /// Value of a tracked field, if this kind has it
    pub fn field(&self, field: TrackedField) -> Option<f32> {
        match (self, field) {
            (Reading::Electrical(r), TrackedField::Current) => Some(r.current_ma),
            (Reading::Electrical(r), TrackedField::BusVoltage) => Some(r.bus_voltage_v),
            (Reading::Environmental(r), TrackedField::Temperature) => Some(r.temperature),
            (Reading::Environmental(r), TrackedField::Humidity) => Some(r.humidity),
            _ => None,
        }
    }

    /// True when both readings are the same kind
    pub fn same_kind(&self, other: &Reading) -> bool {
        matches!(
            (self, other),
            (Reading::Electrical(_), Reading::Electrical(_))
                | (Reading::Environmental(_), Reading::Environmental(_))
        )
    }
}

/// Timestamped reading
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sample {
    /// Monotonic time the tick started
    pub timestamp: Millis,
    pub reading: Reading,
}

impl Sample {
    pub fn new(timestamp: Millis, reading: Reading) -> Self {
        Self { timestamp, reading }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_electrical_keys() {
        let reading = ElectricalReading {
            current_ma: 12.5,
            bus_voltage_v: 5.0,
            shunt_voltage_mv: 1.25,
            supply_voltage_v: 5.00125,
            power_mw: 62.5,
        };
        let json = serde_json::to_value(reading).unwrap();
        let keys: alloc::vec::Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        for key in ["current", "busvoltage", "shuntvoltage", "supplyvoltage", "power"] {
            assert!(keys.iter().any(|k| k == key), "missing {}", key);
        }
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn test_environmental_keys() {
        let reading = Reading::Environmental(EnvironmentalReading {
            temperature: 21.5,
            humidity: 40.0,
            measure_device_name: String::try_from("dht22").unwrap(),
        });
        let json = serde_json::to_string(&reading).unwrap();
        assert_eq!(
            json,
            r#"{"temperature":21.5,"humidity":40.0,"measure_device_name":"dht22"}"#
        );
    }

    #[test]
    fn test_tracked_fields_by_kind() {
        let e = Reading::Electrical(ElectricalReading::default());
        let v = Reading::Environmental(EnvironmentalReading::default());

        assert_eq!(
            e.tracked_fields(),
            &[TrackedField::Current, TrackedField::BusVoltage]
        );
        assert_eq!(e.field(TrackedField::Temperature), None);
        assert_eq!(v.field(TrackedField::Humidity), Some(0.0));
        assert!(!e.same_kind(&v));
        assert!(e.same_kind(&e.clone()));
    }

    #[test]
    fn test_caps() {
        assert_eq!(TrackedField::Current.cap(), 1.0);
        assert_eq!(TrackedField::BusVoltage.cap(), 0.32);
        assert_eq!(TrackedField::Humidity.cap(), 1.0);
        assert_eq!(TrackedField::Temperature.cap(), 0.1);
    }
}
