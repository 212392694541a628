//! Configuration type definitions
//!
//! These types represent the node configuration. The firmware receives it
//! as postcard-serialized binary data produced from TOML at build time.

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::time::TimeZone;

/// Maximum SSID length (802.11)
pub const MAX_SSID_LEN: usize = 32;

/// Maximum WPA passphrase length
pub const MAX_PASSWORD_LEN: usize = 64;

/// Maximum broker host name length
pub const MAX_HOST_LEN: usize = 64;

/// Maximum broker credential length
pub const MAX_CREDENTIAL_LEN: usize = 32;

/// Maximum topic template length
pub const MAX_TOPIC_LEN: usize = 64;

/// Maximum length of a topic after placeholder expansion
pub const MAX_RENDERED_TOPIC_LEN: usize = 128;

/// Topic with placeholders expanded
pub type TopicString = String<MAX_RENDERED_TOPIC_LEN>;

/// Maximum label length (host names, prefixes, sensor names)
pub const MAX_LABEL_LEN: usize = 24;

/// Maximum host name length, prefix plus 12 hex digits
pub const MAX_HOSTNAME_LEN: usize = MAX_LABEL_LEN + 12;

/// Maximum candidate access points
pub const MAX_ACCESS_POINTS: usize = 4;

/// Maximum environmental sensor channels
pub const MAX_ENVIRONMENTAL: usize = 2;

/// Placeholder replaced by the client id in topic templates
pub const CLIENT_ID_PLACEHOLDER: &str = "{clientid}";

/// Placeholder replaced by the sensor name in topic templates
pub const SENSOR_PLACEHOLDER: &str = "{sensor}";

/// Node identity settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct DeviceConfig {
    /// Fixed host name; derived from the MAC when unset
    pub hostname: Option<String<MAX_LABEL_LEN>>,
    /// Prefix for the derived host name
    pub hostname_prefix: String<MAX_LABEL_LEN>,
    /// Prefix for the pub/sub client id
    pub client_id_prefix: String<MAX_LABEL_LEN>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            hostname_prefix: label("esp32_"),
            client_id_prefix: label("esp32"),
        }
    }
}

/// Installation site, attached to every telemetry payload
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Location {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
    /// Elevation in metres
    #[serde(default)]
    pub ele: f64,
}

/// Candidate wireless access point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AccessPoint {
    pub ssid: String<MAX_SSID_LEN>,
    #[serde(default)]
    pub password: String<MAX_PASSWORD_LEN>,
    /// Association polls (1 s apart) before giving up on this candidate
    #[serde(default = "default_ap_retries")]
    pub retries: u8,
}

fn default_ap_retries() -> u8 {
    10
}

/// Topic templates
///
/// `{clientid}` expands to the client id everywhere; `{sensor}` expands to
/// the environmental channel name in the temperature/humidity templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct Topics {
    /// Last will and presence
    pub lwt: String<MAX_TOPIC_LEN>,
    /// Inbound commands
    pub control: String<MAX_TOPIC_LEN>,
    /// Periodic status report
    pub status: String<MAX_TOPIC_LEN>,
    /// Full readings and event messages
    pub logging: String<MAX_TOPIC_LEN>,
    pub current: String<MAX_TOPIC_LEN>,
    pub bus_voltage: String<MAX_TOPIC_LEN>,
    pub temperature: String<MAX_TOPIC_LEN>,
    pub humidity: String<MAX_TOPIC_LEN>,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            lwt: topic("telenode/{clientid}/lwt"),
            control: topic("telenode/{clientid}/control"),
            status: topic("telenode/{clientid}/status"),
            logging: topic("telenode/{clientid}/logging"),
            current: topic("telenode/{clientid}/current"),
            bus_voltage: topic("telenode/{clientid}/busvoltage"),
            temperature: topic("telenode/{clientid}/{sensor}/temperature"),
            humidity: topic("telenode/{clientid}/{sensor}/humidity"),
        }
    }
}

impl Topics {
    /// Iterate over `(name, template)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("lwt", self.lwt.as_str()),
            ("control", self.control.as_str()),
            ("status", self.status.as_str()),
            ("logging", self.logging.as_str()),
            ("current", self.current.as_str()),
            ("bus_voltage", self.bus_voltage.as_str()),
            ("temperature", self.temperature.as_str()),
            ("humidity", self.humidity.as_str()),
        ]
        .into_iter()
    }
}

/// Pub/sub broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MqttConfig {
    pub host: String<MAX_HOST_LEN>,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String<MAX_CREDENTIAL_LEN>>,
    #[serde(default)]
    pub password: Option<String<MAX_CREDENTIAL_LEN>>,
    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_s: u16,
    /// Session connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_s: u16,
    #[serde(default)]
    pub topics: Topics,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    60
}

fn default_connect_timeout() -> u16 {
    30
}

/// Sampling and reporting cadence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct TelemetryConfig {
    /// Maximum seconds between two sends of the same channel
    pub period_s: u32,
    /// Sampling tick interval
    pub measure_interval_ms: u32,
    /// Control-channel check interval
    pub check_interval_ms: u32,
    /// Treat every periodic tick as forced
    pub send_forced_always: bool,
    /// Sleep between conversion-ready polls
    pub conversion_poll_interval_ms: u32,
    /// Conversion-ready polls before the tick gives up
    pub conversion_poll_limit: u16,
    /// Settle delay between conversion-ready and the register read
    pub conversion_settle_ms: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            period_s: 60,
            measure_interval_ms: 10_000,
            check_interval_ms: 3_000,
            send_forced_always: false,
            conversion_poll_interval_ms: 20,
            conversion_poll_limit: 50,
            conversion_settle_ms: 200,
        }
    }
}

/// INA226 wiring and conversion settings
///
/// The averaging and conversion-time fields hold the raw 3-bit codes of
/// the configuration register.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct Ina226Config {
    /// 7-bit I2C address
    pub address: u8,
    /// Shunt resistance in ohms
    pub shunt_ohms: f64,
    /// Largest current the installation should see, in amps
    pub max_expected_amps: Option<f64>,
    /// Averaging code (0 = 1 sample .. 7 = 1024 samples)
    pub averaging: u8,
    /// Bus conversion time code (0 = 140 us .. 7 = 8.244 ms)
    pub bus_conversion: u8,
    /// Shunt conversion time code (0 = 140 us .. 7 = 8.244 ms)
    pub shunt_conversion: u8,
}

impl Default for Ina226Config {
    fn default() -> Self {
        Self {
            address: 0x40,
            shunt_ohms: 0.1,
            max_expected_amps: None,
            averaging: 2,
            bus_conversion: 7,
            shunt_conversion: 7,
        }
    }
}

/// Environmental (temperature/humidity) channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EnvironmentalConfig {
    /// Channel name, used for `{sensor}` in topics
    pub name: String<MAX_LABEL_LEN>,
}

/// Watchdog, cooldown and restart policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct SafetyConfig {
    pub enable_watchdog: bool,
    pub watchdog_timeout_ms: u32,
    /// Sleep before restarting after a link failure
    pub link_cooldown_s: u16,
    /// Sleep before restarting after a session failure
    pub session_cooldown_s: u16,
    /// Sleep before restarting after a publish failure
    pub publish_cooldown_s: u16,
    /// Candidate passes per `ensure_link` call (0 = until the watchdog fires)
    pub link_passes: u8,
    /// Restart when a telemetry publish fails
    pub reset_on_publish_failure: bool,
    /// Scheduled restart after this uptime (0 = disabled)
    pub restart_after_s: u32,
    /// Sample without any network activity
    pub disable_inet: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enable_watchdog: true,
            watchdog_timeout_ms: 30_000,
            link_cooldown_s: 30,
            session_cooldown_s: 60,
            publish_cooldown_s: 30,
            link_passes: 1,
            reset_on_publish_failure: true,
            restart_after_s: 0,
            disable_inet: false,
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    pub location: Location,
    #[serde(default)]
    pub timezone: TimeZone,
    #[serde(default)]
    pub wifi: Vec<AccessPoint, MAX_ACCESS_POINTS>,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Electrical channel; absent when no INA226 is fitted
    #[serde(default)]
    pub ina226: Option<Ina226Config>,
    #[serde(default)]
    pub environmental: Vec<EnvironmentalConfig, MAX_ENVIRONMENTAL>,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl NodeConfig {
    /// Telemetry period in milliseconds
    pub fn period_ms(&self) -> u64 {
        u64::from(self.telemetry.period_s) * 1000
    }
}

/// Build a fixed-capacity label, truncating if needed
fn label<const N: usize>(s: &str) -> String<N> {
    let mut out = String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

fn topic(s: &str) -> String<MAX_TOPIC_LEN> {
    label(s)
}

/// Expand `{clientid}` and `{sensor}` in a topic template
pub fn render_topic<const N: usize>(
    template: &str,
    client_id: &str,
    sensor: &str,
) -> Option<String<N>> {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]).ok()?;
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix(CLIENT_ID_PLACEHOLDER) {
            out.push_str(client_id).ok()?;
            rest = after;
        } else if let Some(after) = tail.strip_prefix(SENSOR_PLACEHOLDER) {
            out.push_str(sensor).ok()?;
            rest = after;
        } else {
            out.push('{').ok()?;
            rest = &tail[1..];
        }
    }
    out.push_str(rest).ok()?;
    Some(out)
}
