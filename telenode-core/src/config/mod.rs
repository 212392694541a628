//! Configuration
//!
//! Board-agnostic configuration structures plus validation. With the
//! `toml` feature the layered TOML source is parsed here as well, so the
//! firmware build script and host tests share one loader.

#[cfg(feature = "toml")]
mod merge;
pub mod types;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Serialize};

pub use types::*;

/// Longest client id: prefix, `_`, 12 hex digits
pub const MAX_CLIENT_ID_LEN: usize = MAX_LABEL_LEN + 13;

/// Configuration error
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The source is not valid TOML
    Syntax(String),
    /// The source does not match the schema (missing key, wrong type, too long)
    Schema(String),
    /// A value is out of range
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    /// A `[devices.<mac>]` key is not a MAC address
    DeviceKey(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Syntax(msg) => write!(f, "syntax error: {}", msg),
            ConfigError::Schema(msg) => write!(f, "schema error: {}", msg),
            ConfigError::Invalid { field, reason } => write!(f, "{}: {}", field, reason),
            ConfigError::DeviceKey(key) => write!(f, "device key '{}' is not a MAC address", key),
        }
    }
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

impl NodeConfig {
    /// Check cross-field constraints the schema cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.telemetry;
        if t.period_s == 0 {
            return Err(invalid("telemetry.period_s", "must be positive"));
        }
        if t.measure_interval_ms == 0 {
            return Err(invalid("telemetry.measure_interval_ms", "must be positive"));
        }
        if t.check_interval_ms == 0 {
            return Err(invalid("telemetry.check_interval_ms", "must be positive"));
        }
        if t.conversion_poll_limit == 0 {
            return Err(invalid("telemetry.conversion_poll_limit", "must be positive"));
        }

        let s = &self.safety;
        if s.enable_watchdog && s.watchdog_timeout_ms < 2_000 {
            return Err(invalid(
                "safety.watchdog_timeout_ms",
                "must be at least 2000 (association polls are 1 s apart)",
            ));
        }

        if let Some(ina) = &self.ina226 {
            if !(ina.shunt_ohms > 0.0) {
                return Err(invalid("ina226.shunt_ohms", "must be positive"));
            }
            if ina.address > 0x7F {
                return Err(invalid("ina226.address", "not a 7-bit address"));
            }
            if ina.averaging > 7 || ina.bus_conversion > 7 || ina.shunt_conversion > 7 {
                return Err(invalid("ina226", "averaging/conversion codes are 0..=7"));
            }
        }

        for (i, env) in self.environmental.iter().enumerate() {
            if env.name.is_empty() {
                return Err(invalid("environmental.name", "must not be empty"));
            }
            if self.environmental[..i].iter().any(|e| e.name == env.name) {
                return Err(invalid("environmental.name", "duplicate channel name"));
            }
        }

        if s.disable_inet {
            return Ok(());
        }

        if self.wifi.is_empty() {
            return Err(invalid("wifi", "at least one access point is required"));
        }
        if self.wifi.iter().any(|ap| ap.ssid.is_empty()) {
            return Err(invalid("wifi.ssid", "must not be empty"));
        }
        if self.wifi.iter().any(|ap| ap.retries == 0) {
            return Err(invalid("wifi.retries", "must be positive"));
        }

        let m = &self.mqtt;
        if m.host.is_empty() {
            return Err(invalid("mqtt.host", "must not be empty"));
        }
        if m.port == 0 {
            return Err(invalid("mqtt.port", "must be positive"));
        }
        if m.keepalive_s <= 10 {
            return Err(invalid("mqtt.keepalive_s", "must be greater than 10"));
        }
        if m.connect_timeout_s == 0 {
            return Err(invalid("mqtt.connect_timeout_s", "must be positive"));
        }

        // Every template must expand into a rendered topic for the longest
        // client id and sensor name.
        let longest_id: String = ['x'; MAX_CLIENT_ID_LEN].iter().collect();
        let longest_sensor: String = ['x'; MAX_LABEL_LEN].iter().collect();
        for (name, template) in m.topics.iter() {
            if template.is_empty() {
                return Err(invalid("mqtt.topics", "topic must not be empty"));
            }
            if render_topic::<MAX_RENDERED_TOPIC_LEN>(template, &longest_id, &longest_sensor)
                .is_none()
            {
                return Err(invalid(name, "rendered topic too long"));
            }
        }

        Ok(())
    }
}

/// Base configuration plus per-device overrides
///
/// Overrides are complete configurations already merged over the base, so
/// selecting one at runtime is a lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSet {
    pub base: NodeConfig,
    pub devices: Vec<DeviceOverride>,
}

/// Configuration for one device, keyed by MAC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceOverride {
    pub mac: [u8; 6],
    pub config: NodeConfig,
}

impl ConfigSet {
    /// Configuration for the device with this MAC
    pub fn select(&self, mac: &[u8; 6]) -> &NodeConfig {
        self.devices
            .iter()
            .find(|d| &d.mac == mac)
            .map(|d| &d.config)
            .unwrap_or(&self.base)
    }

    /// Validate the base and every override
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base.validate()?;
        for device in &self.devices {
            device.config.validate()?;
        }
        Ok(())
    }
}

/// Parse `aa:bb:cc:dd:ee:ff`, `aa-bb-..` or `aabbccddeeff` (any case)
pub fn parse_mac(key: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut digits = key.chars().filter(|c| *c != ':' && *c != '-');
    for byte in mac.iter_mut() {
        let hi = digits.next()?.to_digit(16)?;
        let lo = digits.next()?.to_digit(16)?;
        *byte = (hi << 4 | lo) as u8;
    }
    if digits.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> NodeConfig {
        let mut wifi = heapless::Vec::new();
        wifi.push(AccessPoint {
            ssid: heapless::String::try_from("home").unwrap(),
            password: heapless::String::try_from("secret").unwrap(),
            retries: 10,
        })
        .unwrap();
        NodeConfig {
            device: DeviceConfig::default(),
            location: Location::default(),
            timezone: Default::default(),
            wifi,
            mqtt: MqttConfig {
                host: heapless::String::try_from("broker.lan").unwrap(),
                port: 1883,
                username: None,
                password: None,
                keepalive_s: 60,
                connect_timeout_s: 30,
                topics: Topics::default(),
            },
            telemetry: TelemetryConfig::default(),
            ina226: Some(Ina226Config::default()),
            environmental: heapless::Vec::new(),
            safety: SafetyConfig::default(),
        }
    }

    #[test]
    fn test_minimal_is_valid() {
        assert_eq!(minimal().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_empty_wifi() {
        let mut config = minimal();
        config.wifi.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "wifi", .. })
        ));

        config.safety.disable_inet = true;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_rejects_short_keepalive() {
        let mut config = minimal();
        config.mqtt.keepalive_s = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_ina_codes() {
        let mut config = minimal();
        if let Some(ina) = config.ina226.as_mut() {
            ina.averaging = 8;
        }
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "ina226", .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_sensor_names() {
        let mut config = minimal();
        let name = heapless::String::try_from("dht").unwrap();
        config
            .environmental
            .push(EnvironmentalConfig { name: name.clone() })
            .unwrap();
        config.environmental.push(EnvironmentalConfig { name }).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_mac() {
        let expected = [0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03];
        assert_eq!(parse_mac("aa:bb:cc:01:02:03"), Some(expected));
        assert_eq!(parse_mac("AABBCC010203"), Some(expected));
        assert_eq!(parse_mac("aa-bb-cc-01-02-03"), Some(expected));
        assert_eq!(parse_mac("aabbcc0102"), None);
        assert_eq!(parse_mac("aabbcc01020304"), None);
        assert_eq!(parse_mac("zzbbcc010203"), None);
    }

    #[test]
    fn test_select_falls_back_to_base() {
        let base = minimal();
        let mut other = minimal();
        other.telemetry.period_s = 5;
        let set = ConfigSet {
            base: base.clone(),
            devices: alloc::vec![DeviceOverride {
                mac: [1, 2, 3, 4, 5, 6],
                config: other,
            }],
        };

        assert_eq!(set.select(&[1, 2, 3, 4, 5, 6]).telemetry.period_s, 5);
        assert_eq!(set.select(&[0; 6]), &base);
    }
}
