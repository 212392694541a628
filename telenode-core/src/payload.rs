//! Payload formatting
//!
//! Every telemetry message is one flat JSON object:
//!
//! ```json
//! {"lat": 52.52, "lon": 13.4, "ele": 34.0,
//!  "created_at": "2024-05-01T12:00:00+02:00", "value": 12.5}
//! ```
//!
//! `value` is a scalar for single-quantity topics and an object for the
//! logging and status topics.

use core::fmt::Write;

use alloc::string::String;
use heapless::String as HString;
use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::config::{Location, MAX_HOSTNAME_LEN, MAX_SSID_LEN};
use crate::time::{iso8601, IsoString, TimeZone};
use crate::traits::{Clock, ScanEntry};

/// Dotted-quad IPv4 address
pub type IpString = HString<15>;

/// MAC address as text
pub type MacString = HString<17>;

/// Payload encoding failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PayloadError;

impl From<serde_json::Error> for PayloadError {
    fn from(_: serde_json::Error) -> Self {
        PayloadError
    }
}

#[derive(serde::Serialize)]
struct Envelope<'a, T: ?Sized> {
    lat: f64,
    lon: f64,
    ele: f64,
    created_at: &'a str,
    value: &'a T,
}

/// Wrap `value` in the location/timestamp envelope
pub fn envelope<T: Serialize + ?Sized>(
    location: &Location,
    created_at: &str,
    value: &T,
) -> Result<String, PayloadError> {
    let envelope = Envelope {
        lat: location.lat,
        lon: location.lon,
        ele: location.ele,
        created_at,
        value,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Timestamp for a payload created now
///
/// Before the wall clock is set, seconds since boot are used so that
/// timestamps still increase.
pub fn created_at<C: Clock + ?Sized>(clock: &C, tz: TimeZone) -> IsoString {
    match clock.unix_time() {
        Some(secs) => iso8601(secs, tz),
        None => iso8601((clock.now_ms() / 1000) as i64, TimeZone::Utc),
    }
}

/// Format an IPv4 address
pub fn format_ipv4(octets: [u8; 4]) -> IpString {
    let mut out = IpString::new();
    let _ = write!(out, "{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
    out
}

/// Format a MAC address, optionally with a separator between octets
pub fn format_mac(mac: &[u8; 6], separator: Option<char>) -> MacString {
    let mut out = MacString::new();
    for (i, b) in mac.iter().enumerate() {
        if i > 0 {
            if let Some(sep) = separator {
                let _ = out.push(sep);
            }
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Scan entry as reported in the status payload
pub struct ScanView<'a>(pub &'a ScanEntry);

impl Serialize for ScanView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ScanEntry", 4)?;
        s.serialize_field("ssid", self.0.ssid.as_str())?;
        s.serialize_field("bssid", format_mac(&self.0.bssid, None).as_str())?;
        s.serialize_field("channel", &self.0.channel)?;
        s.serialize_field("rssi", &self.0.rssi)?;
        s.end()
    }
}

/// Scan list as reported in the status payload
pub struct ScanListView<'a>(pub &'a [ScanEntry]);

impl Serialize for ScanListView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(ScanView))
    }
}

/// Radio configuration block of the status payload
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WifiConfigStatus {
    pub mac: MacString,
    pub ssid: HString<MAX_SSID_LEN>,
    pub channel: u8,
    pub reconnects: u32,
    pub hostname: HString<MAX_HOSTNAME_LEN>,
}

/// Link block of the status payload
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WifiStatus {
    pub ip: IpString,
    pub subnet: IpString,
    pub gateway: Option<IpString>,
    pub dns: Option<IpString>,
    pub strength: Option<i8>,
    pub config: WifiConfigStatus,
}

/// Periodic status report
#[derive(serde::Serialize)]
pub struct StatusReport<'a> {
    pub wifi: &'a WifiStatus,
    pub wifi_scan: Option<ScanListView<'a>>,
    pub runtime_seconds: u64,
    pub running_since: &'a str,
    /// Seconds until the scheduled restart, -1 when none is scheduled
    pub reboot_pending_in: i64,
}
