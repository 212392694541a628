//! esp-radio station adapter
//!
//! Association is handled by the wifi controller; the IP layer is the
//! embassy-net stack, whose runner lives in [`net_task`].

use alloc::string::String;

use defmt::*;
use embassy_net::{Runner, Stack};
use esp_radio::wifi::{ClientConfig, ModeConfig, ScanConfig, WifiController, WifiDevice};
use heapless::String as HString;

use telenode_core::traits::radio::MAX_SCAN_RESULTS;
use telenode_core::traits::{IpConfig, Radio, RadioError, ScanEntry, ScanList};

/// Packet processing, DHCP and DNS for the station interface
#[embassy_executor::task]
pub async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}

/// Wifi station plus its IP stack
pub struct EspRadio {
    controller: WifiController<'static>,
    stack: Stack<'static>,
    mac: [u8; 6],
}

impl EspRadio {
    pub fn new(controller: WifiController<'static>, stack: Stack<'static>, mac: [u8; 6]) -> Self {
        Self {
            controller,
            stack,
            mac,
        }
    }

    async fn ensure_started(&mut self) -> Result<(), RadioError> {
        if self.controller.is_started().unwrap_or(false) {
            return Ok(());
        }
        self.controller.start_async().await.map_err(|e| {
            warn!("wifi start failed: {:?}", e);
            RadioError::NotStarted
        })
    }
}

impl Radio for EspRadio {
    async fn scan(&mut self) -> Result<ScanList, RadioError> {
        self.ensure_started().await?;
        let config = ScanConfig::default().with_max(MAX_SCAN_RESULTS);
        let found = self
            .controller
            .scan_with_config_async(config)
            .await
            .map_err(|e| {
                warn!("wifi scan failed: {:?}", e);
                RadioError::Scan
            })?;

        let mut list = ScanList::new();
        for ap in found.iter() {
            let mut ssid = HString::new();
            if ssid.push_str(ap.ssid.as_str()).is_err() {
                continue;
            }
            let entry = ScanEntry {
                ssid,
                bssid: ap.bssid,
                channel: ap.channel,
                rssi: ap.signal_strength,
            };
            if list.push(entry).is_err() {
                break;
            }
        }
        debug!("wifi scan: {=usize} access points", list.len());
        Ok(list)
    }

    async fn connect(
        &mut self,
        ssid: &str,
        password: &str,
        bssid: Option<[u8; 6]>,
    ) -> Result<(), RadioError> {
        let mut client = ClientConfig::default()
            .with_ssid(String::from(ssid))
            .with_password(String::from(password));
        if let Some(bssid) = bssid {
            client = client.with_bssid(bssid);
        }

        if self.controller.is_connected().unwrap_or(false) {
            let _ = self.controller.disconnect_async().await;
        }
        self.controller
            .set_config(&ModeConfig::Client(client))
            .map_err(|e| {
                warn!("wifi set_config failed: {:?}", e);
                RadioError::Driver
            })?;
        self.ensure_started().await?;
        self.controller.connect().map_err(|e| {
            warn!("wifi connect failed: {:?}", e);
            RadioError::Association
        })
    }

    fn is_connected(&mut self) -> bool {
        self.controller.is_connected().unwrap_or(false) && self.stack.is_config_up()
    }

    async fn disconnect(&mut self) -> Result<(), RadioError> {
        self.controller
            .disconnect_async()
            .await
            .map_err(|_| RadioError::Association)
    }

    fn ip_config(&self) -> Option<IpConfig> {
        let config = self.stack.config_v4()?;
        Some(IpConfig {
            address: config.address.address().octets(),
            prefix_len: config.address.prefix_len(),
            gateway: config.gateway.map(|gw| gw.octets()),
            dns: config.dns_servers.first().map(|dns| dns.octets()),
        })
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    async fn rssi(&mut self) -> Option<i8> {
        self.controller
            .rssi()
            .ok()
            .map(|rssi| rssi.clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8)
    }
}
