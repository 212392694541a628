//! Civil time and ISO-8601 timestamps
//!
//! Telemetry carries a `created_at` string with an explicit UTC offset.
//! The node only knows UNIX seconds (from SNTP), so the calendar math and
//! the daylight-saving rule live here.

use core::fmt::{self, Write};

use heapless::String;
use serde::{Deserialize, Serialize};

/// Length of `YYYY-MM-DDTHH:MM:SS+HH:MM`
pub const ISO8601_LEN: usize = 25;

/// Formatted ISO-8601 timestamp
pub type IsoString = String<ISO8601_LEN>;

const SECONDS_PER_DAY: i64 = 86_400;

/// Time zone used for `created_at` timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum TimeZone {
    /// UTC, offset `+00:00`
    Utc,
    /// Fixed offset from UTC in minutes
    Fixed(i16),
    /// CET/CEST with the EU daylight-saving rule
    #[default]
    CentralEurope,
}

impl TimeZone {
    /// Offset from UTC in seconds at the given instant
    pub fn offset_seconds(&self, unix_secs: i64) -> i32 {
        match self {
            TimeZone::Utc => 0,
            TimeZone::Fixed(minutes) => i32::from(*minutes) * 60,
            TimeZone::CentralEurope => {
                let (year, _, _) = civil_from_days(unix_secs.div_euclid(SECONDS_PER_DAY));
                // Summer time runs from 01:00 UTC on the last Sunday of
                // March to 01:00 UTC on the last Sunday of October.
                let start = last_sunday_utc(year, 3, 1);
                let stop = last_sunday_utc(year, 10, 1);
                if unix_secs >= start && unix_secs < stop {
                    2 * 3600
                } else {
                    3600
                }
            }
        }
    }
}

/// Broken-down local time with its UTC offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DateTime {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Offset from UTC in seconds
    pub offset_s: i32,
}

impl DateTime {
    /// Convert UNIX seconds to local time in `tz`
    pub fn from_unix(unix_secs: i64, tz: TimeZone) -> Self {
        let offset_s = tz.offset_seconds(unix_secs);
        let local = unix_secs + i64::from(offset_s);
        let days = local.div_euclid(SECONDS_PER_DAY);
        let secs_of_day = local.rem_euclid(SECONDS_PER_DAY);
        let (year, month, day) = civil_from_days(days);

        Self {
            year,
            month,
            day,
            hour: (secs_of_day / 3600) as u8,
            minute: ((secs_of_day % 3600) / 60) as u8,
            second: (secs_of_day % 60) as u8,
            offset_s,
        }
    }

    /// Format as `YYYY-MM-DDTHH:MM:SS+HH:MM`
    pub fn to_iso8601(&self) -> IsoString {
        let mut out = IsoString::new();
        // Only years past 9999 overflow the buffer
        let _ = write!(out, "{}", self);
        out
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.offset_s < 0 { '-' } else { '+' };
        let offset = self.offset_s.unsigned_abs();
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}{}{:02}:{:02}",
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            sign,
            offset / 3600,
            (offset % 3600) / 60
        )
    }
}

/// Format UNIX seconds as an ISO-8601 string in `tz`
pub fn iso8601(unix_secs: i64, tz: TimeZone) -> IsoString {
    DateTime::from_unix(unix_secs, tz).to_iso8601()
}

/// Days since 1970-01-01 for a proleptic Gregorian date
pub fn days_from_civil(year: i32, month: u8, day: u8) -> i64 {
    let y = i64::from(year) - i64::from(month <= 2);
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(month);
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Calendar date for a day count since 1970-01-01
pub fn civil_from_days(days: i64) -> (i32, u8, u8) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year as i32, month, day)
}

/// Day of week, 0 = Sunday
pub fn weekday(days: i64) -> u8 {
    // 1970-01-01 was a Thursday
    (days + 4).rem_euclid(7) as u8
}

/// UNIX seconds of `hour`:00 UTC on the last Sunday of `month`
pub fn last_sunday_utc(year: i32, month: u8, hour: u8) -> i64 {
    let first_of_next = if month == 12 {
        days_from_civil(year + 1, 1, 1)
    } else {
        days_from_civil(year, month + 1, 1)
    };
    let last_day = first_of_next - 1;
    let sunday = last_day - i64::from(weekday(last_day));
    sunday * SECONDS_PER_DAY + i64::from(hour) * 3600
}

/// Size of an SNTP packet without extensions
pub const SNTP_PACKET_LEN: usize = 48;

/// Seconds between the NTP era start (1900) and the UNIX epoch
pub const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// Client request: LI 0, version 4, mode 3
pub fn sntp_request() -> [u8; SNTP_PACKET_LEN] {
    let mut packet = [0u8; SNTP_PACKET_LEN];
    packet[0] = 0b00_100_011;
    packet
}

/// UNIX seconds from a server reply's transmit timestamp
///
/// Rejects short packets, non-server modes, kiss-of-death (stratum 0)
/// and an unsynchronised leap indicator.
pub fn parse_sntp_reply(packet: &[u8]) -> Option<i64> {
    if packet.len() < SNTP_PACKET_LEN {
        return None;
    }
    let leap = packet[0] >> 6;
    let mode = packet[0] & 0b111;
    let stratum = packet[1];
    if leap == 3 || mode != 4 || stratum == 0 {
        return None;
    }
    let secs = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    if secs == 0 {
        return None;
    }
    // Era 1 starts in 2036; timestamps below the epoch offset belong to it.
    let secs = i64::from(secs);
    let era = if secs < NTP_UNIX_OFFSET { 1i64 << 32 } else { 0 };
    Some(secs + era - NTP_UNIX_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_round_trip() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(days_from_civil(2000, 3, 1), 11_017);
        assert_eq!(civil_from_days(11_017), (2000, 3, 1));
        assert_eq!(civil_from_days(days_from_civil(2024, 2, 29)), (2024, 2, 29));
    }

    #[test]
    fn test_weekday() {
        assert_eq!(weekday(0), 4); // Thursday
        assert_eq!(weekday(days_from_civil(2024, 3, 31)), 0); // Sunday
    }

    #[test]
    fn test_last_sunday() {
        // 2024-03-31 01:00 UTC and 2024-10-27 01:00 UTC
        assert_eq!(last_sunday_utc(2024, 3, 1), 1_711_846_800);
        assert_eq!(last_sunday_utc(2024, 10, 1), 1_729_990_800);
        // December wraps into the next year
        assert_eq!(
            civil_from_days(last_sunday_utc(2023, 12, 0) / SECONDS_PER_DAY),
            (2023, 12, 31)
        );
    }

    #[test]
    fn test_utc_format() {
        assert_eq!(iso8601(0, TimeZone::Utc).as_str(), "1970-01-01T00:00:00+00:00");
        assert_eq!(
            iso8601(1_700_000_000, TimeZone::Utc).as_str(),
            "2023-11-14T22:13:20+00:00"
        );
    }

    #[test]
    fn test_fixed_negative_offset() {
        let tz = TimeZone::Fixed(-330);
        assert_eq!(iso8601(0, tz).as_str(), "1969-12-31T18:30:00-05:30");
    }

    #[test]
    fn test_central_europe_dst_boundaries() {
        let tz = TimeZone::CentralEurope;
        let start = last_sunday_utc(2024, 3, 1);
        let stop = last_sunday_utc(2024, 10, 1);

        assert_eq!(iso8601(start - 1, tz).as_str(), "2024-03-31T01:59:59+01:00");
        assert_eq!(iso8601(start, tz).as_str(), "2024-03-31T03:00:00+02:00");
        assert_eq!(iso8601(stop - 1, tz).as_str(), "2024-10-27T02:59:59+02:00");
        assert_eq!(iso8601(stop, tz).as_str(), "2024-10-27T02:00:00+01:00");
    }

    fn reply(first: u8, stratum: u8, secs: u32) -> [u8; SNTP_PACKET_LEN] {
        let mut packet = [0u8; SNTP_PACKET_LEN];
        packet[0] = first;
        packet[1] = stratum;
        packet[40..44].copy_from_slice(&secs.to_be_bytes());
        packet
    }

    #[test]
    fn test_sntp_request_header() {
        let packet = sntp_request();
        assert_eq!(packet[0], 0x23);
        assert!(packet[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_sntp_reply() {
        // 2023-11-14T22:13:20Z
        let secs = (1_700_000_000 + NTP_UNIX_OFFSET) as u32;
        assert_eq!(parse_sntp_reply(&reply(0x24, 2, secs)), Some(1_700_000_000));

        // Client mode, stratum 0, unsynchronised and truncated replies
        assert_eq!(parse_sntp_reply(&reply(0x23, 2, secs)), None);
        assert_eq!(parse_sntp_reply(&reply(0x24, 0, secs)), None);
        assert_eq!(parse_sntp_reply(&reply(0xE4, 2, secs)), None);
        assert_eq!(parse_sntp_reply(&reply(0x24, 2, secs)[..40]), None);
    }

    #[test]
    fn test_sntp_era_rollover() {
        // 2036-02-07T06:28:16Z is NTP second 0 of era 1
        assert_eq!(parse_sntp_reply(&reply(0x24, 1, 1)), Some(2_085_978_497));
    }
}
