//! Layered TOML loading
//!
//! Layers, lowest priority first:
//!
//! 1. `node.toml`, the base configuration
//! 2. `node.local.toml`, an optional site-local override merged over it
//! 3. `[devices."<mac>"]` tables, each merged over the result for one device
//!
//! Tables merge key by key, recursively. Scalars and arrays replace.

use alloc::format;
use alloc::string::ToString;
use alloc::vec::Vec;

use toml::{Table, Value};

use super::{parse_mac, ConfigError, ConfigSet, DeviceOverride, NodeConfig};

/// Top-level table holding per-device overrides
pub const DEVICE_TABLE: &str = "devices";

/// Merge `overlay` into `base`
pub fn update_deep(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                update_deep(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_table(source: &str) -> Result<Table, ConfigError> {
    toml::from_str::<Table>(source).map_err(|e| ConfigError::Syntax(e.message().to_string()))
}

fn to_config(table: Table) -> Result<NodeConfig, ConfigError> {
    Value::Table(table)
        .try_into::<NodeConfig>()
        .map_err(|e| ConfigError::Schema(e.message().to_string()))
}

impl ConfigSet {
    /// Parse the base source and an optional local override
    ///
    /// Every resulting configuration is validated.
    pub fn from_toml(base: &str, local: Option<&str>) -> Result<Self, ConfigError> {
        let mut root = parse_table(base)?;
        if let Some(local) = local {
            update_deep(&mut root, parse_table(local)?);
        }

        let device_tables = match root.remove(DEVICE_TABLE) {
            None => Table::new(),
            Some(Value::Table(t)) => t,
            Some(_) => {
                return Err(ConfigError::Schema(format!(
                    "'{}' must be a table keyed by MAC address",
                    DEVICE_TABLE
                )))
            }
        };

        let mut devices = Vec::with_capacity(device_tables.len());
        for (key, value) in device_tables {
            let mac = parse_mac(&key).ok_or_else(|| ConfigError::DeviceKey(key.clone()))?;
            let Value::Table(overlay) = value else {
                return Err(ConfigError::Schema(format!("device '{}' must be a table", key)));
            };
            let mut merged = root.clone();
            update_deep(&mut merged, overlay);
            devices.push(DeviceOverride {
                mac,
                config: to_config(merged)?,
            });
        }

        let set = ConfigSet {
            base: to_config(root)?,
            devices,
        };
        set.validate()?;
        Ok(set)
    }
}

impl NodeConfig {
    /// Parse a single TOML document without device overrides
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Ok(ConfigSet::from_toml(source, None)?.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeZone;

    const BASE: &str = r#"
        timezone = "central_europe"

        [location]
        lat = 52.52
        lon = 13.40
        ele = 34

        [[wifi]]
        ssid = "attic"
        password = "hunter22"

        [[wifi]]
        ssid = "garage"
        password = "hunter23"
        retries = 5

        [mqtt]
        host = "broker.lan"

        [mqtt.topics]
        status = "site/{clientid}/status"

        [telemetry]
        period_s = 120

        [ina226]
        shunt_ohms = 0.1
        max_expected_amps = 0.5
    "#;

    #[test]
    fn test_base_defaults() {
        let config = NodeConfig::from_toml(BASE).unwrap();

        assert_eq!(config.timezone, TimeZone::CentralEurope);
        assert_eq!(config.location.ele, 34.0);
        assert_eq!(config.wifi.len(), 2);
        assert_eq!(config.wifi[0].retries, 10);
        assert_eq!(config.wifi[1].retries, 5);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keepalive_s, 60);
        assert_eq!(config.mqtt.topics.status.as_str(), "site/{clientid}/status");
        assert_eq!(config.mqtt.topics.lwt.as_str(), "telenode/{clientid}/lwt");
        assert_eq!(config.telemetry.period_s, 120);
        assert_eq!(config.telemetry.check_interval_ms, 3_000);

        let ina = config.ina226.unwrap();
        assert_eq!(ina.address, 0x40);
        assert_eq!(ina.max_expected_amps, Some(0.5));
        assert!(config.safety.enable_watchdog);
    }

    #[test]
    fn test_local_override_merges_deep() {
        let local = r#"
            [mqtt]
            port = 8883

            [mqtt.topics]
            control = "site/{clientid}/cmd"

            [safety]
            enable_watchdog = false
        "#;
        let set = ConfigSet::from_toml(BASE, Some(local)).unwrap();
        let config = &set.base;

        assert_eq!(config.mqtt.host.as_str(), "broker.lan");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.topics.status.as_str(), "site/{clientid}/status");
        assert_eq!(config.mqtt.topics.control.as_str(), "site/{clientid}/cmd");
        assert!(!config.safety.enable_watchdog);
        assert_eq!(config.telemetry.period_s, 120);
    }

    #[test]
    fn test_local_override_replaces_arrays() {
        let local = r#"
            [[wifi]]
            ssid = "lab"
        "#;
        let set = ConfigSet::from_toml(BASE, Some(local)).unwrap();
        assert_eq!(set.base.wifi.len(), 1);
        assert_eq!(set.base.wifi[0].ssid.as_str(), "lab");
        assert!(set.base.wifi[0].password.is_empty());
    }

    #[test]
    fn test_device_override_applies_to_matching_mac() {
        let local = r#"
            [devices."AA:BB:CC:00:11:22".telemetry]
            period_s = 10

            [devices."aabbcc001123".device]
            hostname = "shed"
        "#;
        let set = ConfigSet::from_toml(BASE, Some(local)).unwrap();

        let first = set.select(&[0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);
        assert_eq!(first.telemetry.period_s, 10);
        assert_eq!(first.mqtt.host.as_str(), "broker.lan");
        assert!(first.device.hostname.is_none());

        let second = set.select(&[0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x23]);
        assert_eq!(second.telemetry.period_s, 120);
        assert_eq!(second.device.hostname.as_deref(), Some("shed"));

        let other = set.select(&[0; 6]);
        assert_eq!(other.telemetry.period_s, 120);
        assert!(other.device.hostname.is_none());
    }

    #[test]
    fn test_bad_device_key() {
        let local = r#"
            [devices.kitchen.telemetry]
            period_s = 10
        "#;
        assert_eq!(
            ConfigSet::from_toml(BASE, Some(local)),
            Err(ConfigError::DeviceKey("kitchen".into()))
        );
    }

    #[test]
    fn test_missing_required_key() {
        let source = r#"
            [location]
            lat = 1.0
            lon = 2.0
        "#;
        assert!(matches!(
            NodeConfig::from_toml(source),
            Err(ConfigError::Schema(_))
        ));
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(
            NodeConfig::from_toml("[mqtt\nhost = 1"),
            Err(ConfigError::Syntax(_))
        ));
    }

    #[test]
    fn test_overlong_ssid_is_schema_error() {
        let local = r#"
            [[wifi]]
            ssid = "this-ssid-is-definitely-longer-than-32-bytes"
        "#;
        assert!(matches!(
            ConfigSet::from_toml(BASE, Some(local)),
            Err(ConfigError::Schema(_))
        ));
    }

    #[test]
    fn test_validation_runs_on_devices() {
        let local = r#"
            [devices."aabbcc001122".telemetry]
            period_s = 0
        "#;
        assert!(matches!(
            ConfigSet::from_toml(BASE, Some(local)),
            Err(ConfigError::Invalid {
                field: "telemetry.period_s",
                ..
            })
        ));
    }

    #[test]
    fn test_update_deep() {
        let mut base: Table = toml::from_str("a = 1\n[t]\nx = 1\ny = 2").unwrap();
        let overlay: Table = toml::from_str("b = 2\n[t]\ny = 3").unwrap();
        update_deep(&mut base, overlay);

        assert_eq!(base["a"].as_integer(), Some(1));
        assert_eq!(base["b"].as_integer(), Some(2));
        assert_eq!(base["t"]["x"].as_integer(), Some(1));
        assert_eq!(base["t"]["y"].as_integer(), Some(3));
    }
}
