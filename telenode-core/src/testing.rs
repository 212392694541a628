//! Scripted fakes for host tests

use std::collections::VecDeque;
use std::string::{String, ToString};
use std::vec::Vec;

use embedded_hal_async::delay::DelayNs;

use crate::config::{
    AccessPoint, DeviceConfig, EnvironmentalConfig, Ina226Config, Location, MqttConfig,
    NodeConfig, SafetyConfig, TelemetryConfig, Topics,
};
use crate::sample::ElectricalReading;
use crate::time::TimeZone;
use crate::traits::{
    ClientError, Clock, ConnectOptions, ElectricalSensor, EnvironmentalSensor, InboundMessage,
    IpConfig, PubSubClient, QoS, Radio, RadioError, Restart, ScanEntry, ScanList, SensorError,
    Watchdog,
};
use crate::Millis;

pub const TEST_MAC: [u8; 6] = [0x24, 0x0a, 0xc4, 0x00, 0x11, 0x22];

/// Clock advanced only by delays
#[derive(Debug, Default)]
pub struct FakePlatform {
    now: Millis,
    pub unix: Option<i64>,
    pub feeds: u32,
    pub restarts: u32,
    pub delays: Vec<u32>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_now(&mut self, now: Millis) {
        self.now = now;
    }

    pub fn advance(&mut self, ms: Millis) {
        self.now += ms;
    }
}

impl Watchdog for FakePlatform {
    fn feed(&mut self) {
        self.feeds += 1;
    }
}

impl Restart for FakePlatform {
    fn restart(&mut self) {
        self.restarts += 1;
    }
}

impl Clock for FakePlatform {
    fn now_ms(&self) -> Millis {
        self.now
    }

    fn unix_time(&self) -> Option<i64> {
        self.unix
    }
}

impl DelayNs for FakePlatform {
    async fn delay_ns(&mut self, ns: u32) {
        self.now += Millis::from(ns / 1_000_000);
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
        self.now += Millis::from(ms);
    }
}

/// Radio whose access points associate after a number of polls
#[derive(Debug)]
pub struct FakeRadio {
    /// What a scan returns
    pub visible: Vec<ScanEntry>,
    /// SSIDs that accept an association
    pub reachable: Vec<String>,
    /// `is_connected` polls before a reachable association completes
    pub polls_to_associate: u32,
    pub fail_scan: bool,
    pub connected: bool,
    pending: Option<String>,
    polls: u32,
    pub connects: Vec<(String, Option<[u8; 6]>)>,
    pub scans: u32,
    pub disconnects: u32,
    pub ip: IpConfig,
    pub rssi: i8,
}

impl FakeRadio {
    pub fn new() -> Self {
        Self {
            visible: Vec::new(),
            reachable: Vec::new(),
            polls_to_associate: 0,
            fail_scan: false,
            connected: false,
            pending: None,
            polls: 0,
            connects: Vec::new(),
            scans: 0,
            disconnects: 0,
            ip: IpConfig {
                address: [192, 168, 1, 50],
                prefix_len: 24,
                gateway: Some([192, 168, 1, 1]),
                dns: Some([192, 168, 1, 1]),
            },
            rssi: -60,
        }
    }

    /// One visible, reachable access point
    pub fn with_ap(ssid: &str, bssid: [u8; 6], rssi: i8) -> Self {
        let mut radio = Self::new();
        radio.add_visible(ssid, bssid, rssi);
        radio.reachable.push(ssid.to_string());
        radio
    }

    pub fn add_visible(&mut self, ssid: &str, bssid: [u8; 6], rssi: i8) {
        self.visible.push(ScanEntry {
            ssid: heapless::String::try_from(ssid).unwrap(),
            bssid,
            channel: 6,
            rssi,
        });
    }

    /// Simulate the access point going away
    pub fn drop_link(&mut self) {
        self.connected = false;
        self.pending = None;
    }
}

impl Radio for FakeRadio {
    async fn scan(&mut self) -> Result<ScanList, RadioError> {
        self.scans += 1;
        if self.fail_scan {
            return Err(RadioError::Scan);
        }
        Ok(self.visible.iter().cloned().collect())
    }

    async fn connect(
        &mut self,
        ssid: &str,
        _password: &str,
        bssid: Option<[u8; 6]>,
    ) -> Result<(), RadioError> {
        self.connects.push((ssid.to_string(), bssid));
        self.pending = Some(ssid.to_string());
        self.polls = 0;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        if self.connected {
            return true;
        }
        if let Some(ssid) = &self.pending {
            if self.reachable.contains(ssid) {
                if self.polls >= self.polls_to_associate {
                    self.connected = true;
                    self.pending = None;
                }
                self.polls += 1;
            }
        }
        self.connected
    }

    async fn disconnect(&mut self) -> Result<(), RadioError> {
        self.disconnects += 1;
        self.connected = false;
        self.pending = None;
        Ok(())
    }

    fn ip_config(&self) -> Option<IpConfig> {
        self.connected.then_some(self.ip)
    }

    fn mac(&self) -> [u8; 6] {
        TEST_MAC
    }

    async fn rssi(&mut self) -> Option<i8> {
        self.connected.then_some(self.rssi)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// Pub/sub client that records traffic
#[derive(Debug, Default)]
pub struct FakeClient {
    pub connected: bool,
    pub fail_connect: Option<ClientError>,
    pub fail_subscribe: Option<ClientError>,
    /// Publishes that fail, counted from the next one
    pub fail_publishes: u32,
    pub fail_poll: Option<ClientError>,
    pub published: Vec<Published>,
    pub subscriptions: Vec<String>,
    pub inbox: VecDeque<InboundMessage>,
    pub pings: u32,
    /// `(client_id, will topic, will payload)` per connect call
    pub connects: Vec<(String, String, String)>,
    pub connect_timeouts: Vec<u32>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&mut self, topic: &str, payload: &str, retained: bool) {
        self.inbox.push_back(InboundMessage {
            topic: heapless::String::try_from(topic).unwrap(),
            payload: heapless::Vec::from_slice(payload.as_bytes()).unwrap(),
            retained,
        });
    }

    /// Published messages on topics ending with `suffix`
    pub fn on_topic(&self, suffix: &str) -> Vec<&Published> {
        self.published
            .iter()
            .filter(|m| m.topic.ends_with(suffix))
            .collect()
    }
}

impl PubSubClient for FakeClient {
    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), ClientError> {
        let (will_topic, will_payload) = options
            .will
            .map(|w| {
                (
                    w.topic.to_string(),
                    String::from_utf8_lossy(w.payload).into_owned(),
                )
            })
            .unwrap_or_default();
        self.connects
            .push((options.client_id.to_string(), will_topic, will_payload));
        self.connect_timeouts.push(options.timeout_ms);
        if let Some(e) = self.fail_connect {
            return Err(e);
        }
        self.connected = true;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        if self.fail_publishes > 0 {
            self.fail_publishes -= 1;
            return Err(ClientError::Transport);
        }
        self.published.push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), ClientError> {
        if let Some(e) = self.fail_subscribe {
            return Err(e);
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<Option<InboundMessage>, ClientError> {
        if let Some(e) = self.fail_poll {
            return Err(e);
        }
        Ok(self.inbox.pop_front())
    }

    async fn ping(&mut self) -> Result<(), ClientError> {
        self.pings += 1;
        Ok(())
    }
}

/// Current/power monitor returning scripted readings
#[derive(Debug, Default)]
pub struct FakeElectrical {
    /// Readings returned in order; the last one repeats
    pub readings: VecDeque<Result<ElectricalReading, SensorError>>,
    /// `is_conversion_ready` calls answering false before a true
    pub not_ready_polls: u32,
    pub ready_checks: u32,
    pub reads: u32,
}

impl FakeElectrical {
    pub fn with(readings: &[ElectricalReading]) -> Self {
        Self {
            readings: readings.iter().copied().map(Ok).collect(),
            ..Default::default()
        }
    }
}

pub fn electrical(current_ma: f32, bus_voltage_v: f32) -> ElectricalReading {
    ElectricalReading {
        current_ma,
        bus_voltage_v,
        shunt_voltage_mv: current_ma * 0.1,
        supply_voltage_v: bus_voltage_v + current_ma * 0.0001,
        power_mw: current_ma * bus_voltage_v,
    }
}

impl ElectricalSensor for FakeElectrical {
    async fn is_conversion_ready(&mut self) -> Result<bool, SensorError> {
        self.ready_checks += 1;
        if self.not_ready_polls > 0 {
            self.not_ready_polls -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn read(&mut self) -> Result<ElectricalReading, SensorError> {
        self.reads += 1;
        match self.readings.len() {
            0 => Err(SensorError::Bus),
            1 => self.readings[0],
            _ => self.readings.pop_front().unwrap_or(Err(SensorError::Bus)),
        }
    }
}

/// Temperature/humidity sensor returning scripted values
#[derive(Debug, Default)]
pub struct FakeEnvironmental {
    pub values: VecDeque<Result<(f32, f32), SensorError>>,
}

impl EnvironmentalSensor for FakeEnvironmental {
    async fn measure(&mut self) -> Result<(f32, f32), SensorError> {
        match self.values.len() {
            0 => Err(SensorError::Checksum),
            1 => self.values[0],
            _ => self.values.pop_front().unwrap_or(Err(SensorError::Checksum)),
        }
    }
}

/// Configuration with one access point, an INA226 and short cooldowns
pub fn test_config() -> NodeConfig {
    let mut wifi = heapless::Vec::new();
    wifi.push(AccessPoint {
        ssid: heapless::String::try_from("attic").unwrap(),
        password: heapless::String::try_from("hunter22").unwrap(),
        retries: 3,
    })
    .unwrap();

    NodeConfig {
        device: DeviceConfig::default(),
        location: Location {
            lat: 52.5,
            lon: 13.25,
            ele: 34.0,
        },
        timezone: TimeZone::Utc,
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
        safety: SafetyConfig {
            link_cooldown_s: 2,
            session_cooldown_s: 3,
            publish_cooldown_s: 1,
            ..SafetyConfig::default()
        },
    }
}

/// [`test_config`] plus one environmental channel
pub fn test_config_with_environmental(name: &str) -> NodeConfig {
    let mut config = test_config();
    config
        .environmental
        .push(EnvironmentalConfig {
            name: heapless::String::try_from(name).unwrap(),
        })
        .unwrap();
    config
}
