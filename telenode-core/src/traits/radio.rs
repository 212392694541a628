//! Wireless station capability

use heapless::{String, Vec};

use crate::config::MAX_SSID_LEN;

/// Maximum access points kept from one scan
pub const MAX_SCAN_RESULTS: usize = 16;

/// Scan results, unordered
pub type ScanList = Vec<ScanEntry, MAX_SCAN_RESULTS>;

/// One access point seen by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanEntry {
    pub ssid: String<MAX_SSID_LEN>,
    pub bssid: [u8; 6],
    pub channel: u8,
    /// Signal strength in dBm
    pub rssi: i8,
}

/// IPv4 configuration obtained from DHCP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IpConfig {
    pub address: [u8; 4],
    pub prefix_len: u8,
    pub gateway: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl IpConfig {
    /// Netmask for the prefix length
    pub fn netmask(&self) -> [u8; 4] {
        let bits = u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len.min(32)))
            .unwrap_or(0);
        bits.to_be_bytes()
    }
}

/// Radio failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioError {
    /// The radio could not be started
    NotStarted,
    /// Scan failed
    Scan,
    /// Association request rejected or failed
    Association,
    /// Driver-level failure
    Driver,
}

/// Wireless station
#[allow(async_fn_in_trait)]
pub trait Radio {
    /// Scan for access points
    async fn scan(&mut self) -> Result<ScanList, RadioError>;

    /// Start associating with an access point
    ///
    /// Returns once the request is issued; progress is observed through
    /// [`Radio::is_connected`].
    async fn connect(
        &mut self,
        ssid: &str,
        password: &str,
        bssid: Option<[u8; 6]>,
    ) -> Result<(), RadioError>;

    /// Associated and holding an IP configuration
    fn is_connected(&mut self) -> bool;

    /// Drop the association
    async fn disconnect(&mut self) -> Result<(), RadioError>;

    /// Current IPv4 configuration, if any
    fn ip_config(&self) -> Option<IpConfig>;

    /// Station MAC address
    fn mac(&self) -> [u8; 6];

    /// Signal strength of the current association in dBm
    async fn rssi(&mut self) -> Option<i8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netmask() {
        let mut ip = IpConfig {
            prefix_len: 24,
            ..Default::default()
        };
        assert_eq!(ip.netmask(), [255, 255, 255, 0]);
        ip.prefix_len = 0;
        assert_eq!(ip.netmask(), [0, 0, 0, 0]);
        ip.prefix_len = 32;
        assert_eq!(ip.netmask(), [255, 255, 255, 255]);
        ip.prefix_len = 20;
        assert_eq!(ip.netmask(), [255, 255, 240, 0]);
    }
}
