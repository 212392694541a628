//! Connectivity supervisor
//!
//! Owns the radio link and the pub/sub session. The `ensure_*` operations
//! are idempotent: they return immediately when the layer is already up and
//! otherwise bring it up within a bounded number of attempts, feeding the
//! watchdog between blocking steps.
//!
//! ```text
//!  LinkState:    Disconnected ──► Associating ──► Associated
//!                     ▲                │               │
//!                     └──── passes ────┘     link lost │
//!                           exhausted                  ▼
//!  SessionState: NoSession ──► Connecting ──► Active ──► NoSession
//!                                   │ failure        ▲ failed op
//!                                   └────────────────┘
//! ```
//!
//! The `*_catch_reset` wrappers are the recovery boundary: a failure is
//! logged, the configured cooldown elapses, and the board is restarted.

mod status;

pub use status::LinkStatus;

use core::fmt::Write;

use heapless::String;

use crate::config::{
    render_topic, ConfigError, NodeConfig, TopicString, MAX_CLIENT_ID_LEN, MAX_HOSTNAME_LEN,
    MAX_SSID_LEN,
};
use crate::payload::format_mac;
use crate::traits::{
    delay_fed, ClientError, ConnectOptions, IpConfig, LastWill, Platform, PubSubClient, QoS,
    Radio, ScanEntry, ScanList,
};
use crate::Millis;

/// Presence payload while the session is up
pub const PRESENCE_ONLINE: &[u8] = b"ONLINE";

/// Last-will payload
pub const PRESENCE_OFFLINE: &[u8] = b"OFFLINE";

/// Interval between association polls
pub const ASSOCIATION_POLL_MS: u32 = 1_000;

/// Keepalive pings are sent this long before the broker deadline
pub const PING_MARGIN_MS: Millis = 10_000;

/// Inbound messages handled per `check_messages` call
pub const MAX_POLLS_PER_CHECK: usize = 8;

/// Broker waits end this long before the watchdog would bite
pub const WATCHDOG_MARGIN_MS: u32 = 1_000;

/// Radio association state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Disconnected,
    Associating,
    Associated,
}

/// Pub/sub session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    NoSession,
    Connecting,
    Active,
}

/// Link bring-up failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// No access point configured
    NoCandidates,
    /// Every candidate failed to associate in every pass
    NoCandidateAssociated { passes: u8 },
}

/// Session bring-up failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionError {
    /// The link is not associated
    LinkDown,
    Connect(ClientError),
    /// Publishing the presence message failed
    Presence(ClientError),
    Subscribe(ClientError),
}

/// Supervisor failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SupervisorError {
    Link(LinkError),
    Session(SessionError),
    /// Publish, poll or ping failed on an established session
    Client(ClientError),
    /// A payload could not be encoded
    Payload,
    /// A restart was requested; the caller must stop
    Restarting,
}

impl From<LinkError> for SupervisorError {
    fn from(e: LinkError) -> Self {
        SupervisorError::Link(e)
    }
}

impl From<SessionError> for SupervisorError {
    fn from(e: SessionError) -> Self {
        SupervisorError::Session(e)
    }
}

/// What an established link looks like
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkInfo {
    pub ip: IpConfig,
    pub ssid: String<MAX_SSID_LEN>,
    /// Access point picked by signal strength, if it was seen in the scan
    pub bssid: Option<[u8; 6]>,
    pub channel: u8,
    pub rssi: Option<i8>,
    /// Associations after the first one
    pub reconnects: u32,
}

/// Names derived from the MAC address
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    pub mac: [u8; 6],
    pub client_id: String<MAX_CLIENT_ID_LEN>,
    pub hostname: String<MAX_HOSTNAME_LEN>,
}

impl Identity {
    /// `<client_id_prefix>_<mac hex>` and the configured or derived host name
    pub fn new(config: &NodeConfig, mac: [u8; 6]) -> Self {
        let hex = format_mac(&mac, None);

        let mut client_id = String::new();
        let _ = write!(client_id, "{}_{}", config.device.client_id_prefix, hex);

        let mut hostname = String::new();
        match &config.device.hostname {
            Some(name) => {
                let _ = hostname.push_str(name);
            }
            None => {
                let _ = write!(hostname, "{}{}", config.device.hostname_prefix, hex);
            }
        }

        Self {
            mac,
            client_id,
            hostname,
        }
    }
}

/// Topics with `{clientid}` expanded
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TopicSet {
    pub lwt: TopicString,
    pub control: TopicString,
    pub status: TopicString,
    pub logging: TopicString,
    pub current: TopicString,
    pub bus_voltage: TopicString,
}

fn expand(template: &str, client_id: &str, sensor: &str) -> Result<TopicString, ConfigError> {
    render_topic(template, client_id, sensor).ok_or(ConfigError::Invalid {
        field: "mqtt.topics",
        reason: "rendered topic too long",
    })
}

impl TopicSet {
    pub fn new(config: &NodeConfig, client_id: &str) -> Result<Self, ConfigError> {
        let t = &config.mqtt.topics;
        Ok(Self {
            lwt: expand(&t.lwt, client_id, "")?,
            control: expand(&t.control, client_id, "")?,
            status: expand(&t.status, client_id, "")?,
            logging: expand(&t.logging, client_id, "")?,
            current: expand(&t.current, client_id, "")?,
            bus_voltage: expand(&t.bus_voltage, client_id, "")?,
        })
    }
}

/// Connectivity supervisor
pub struct Supervisor<'a, R, C> {
    config: &'a NodeConfig,
    radio: R,
    client: C,
    identity: Identity,
    topics: TopicSet,
    link: LinkState,
    session: SessionState,
    link_info: Option<LinkInfo>,
    associations: u32,
    last_scan: Option<ScanList>,
    last_ping: Millis,
    last_status: Option<Millis>,
    boot_ms: Millis,
}

impl<'a, R: Radio, C: PubSubClient> Supervisor<'a, R, C> {
    /// Create a supervisor; nothing is brought up yet
    pub fn new(config: &'a NodeConfig, radio: R, client: C, boot_ms: Millis) -> Result<Self, ConfigError> {
        let identity = Identity::new(config, radio.mac());
        let topics = TopicSet::new(config, &identity.client_id)?;
        Ok(Self {
            config,
            radio,
            client,
            identity,
            topics,
            link: LinkState::Disconnected,
            session: SessionState::NoSession,
            link_info: None,
            associations: 0,
            last_scan: None,
            last_ping: boot_ms,
            last_status: None,
            boot_ms,
        })
    }

    pub fn config(&self) -> &'a NodeConfig {
        self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn session_state(&self) -> SessionState {
        self.session
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Expand a topic template for an environmental channel
    pub fn sensor_topic(&self, template: &str, sensor: &str) -> Result<TopicString, ConfigError> {
        expand(template, &self.identity.client_id, sensor)
    }

    /// Bring the link up if it is down
    pub async fn ensure_link<P: Platform>(&mut self, p: &mut P) -> Result<LinkInfo, LinkError> {
        p.feed();

        if self.link == LinkState::Associated && self.radio.is_connected() {
            if let Some(info) = self.link_info.as_mut() {
                if let Some(ip) = self.radio.ip_config() {
                    info.ip = ip;
                }
                return Ok(info.clone());
            }
        }

        if self.link == LinkState::Associated {
            warn!("link lost");
        }
        self.link = LinkState::Associating;
        // A session cannot outlive its link
        self.session = SessionState::NoSession;

        let config = self.config;
        let candidates = &config.wifi;
        if candidates.is_empty() {
            self.link = LinkState::Disconnected;
            return Err(LinkError::NoCandidates);
        }

        let passes = config.safety.link_passes;
        let mut pass: u8 = 0;
        loop {
            for ap in candidates.iter() {
                p.feed();
                if let Some(info) = self.try_candidate(p, &ap.ssid, &ap.password, ap.retries).await {
                    return Ok(info);
                }
            }

            pass = pass.saturating_add(1);
            if passes != 0 && pass >= passes {
                break;
            }
            info!("starting candidate pass {=u8}", pass.saturating_add(1));
        }

        self.link = LinkState::Disconnected;
        Err(LinkError::NoCandidateAssociated { passes: pass })
    }

    /// Scan, associate and wait for one candidate
    async fn try_candidate<P: Platform>(
        &mut self,
        p: &mut P,
        ssid: &str,
        password: &str,
        retries: u8,
    ) -> Option<LinkInfo> {
        let scan = match self.radio.scan().await {
            Ok(scan) => scan,
            Err(e) => {
                warn!("scan failed: {}", e);
                ScanList::new()
            }
        };
        p.feed();

        let best = scan
            .iter()
            .filter(|entry| entry.ssid.as_str() == ssid)
            .max_by_key(|entry| entry.rssi)
            .cloned();
        self.last_scan = Some(scan);

        match &best {
            Some(entry) => info!(
                "connecting to {=str} via {=[u8]:x} (rssi {=i8})",
                ssid,
                &entry.bssid[..],
                entry.rssi
            ),
            None => info!("connecting to {=str} (not seen in scan)", ssid),
        }

        if let Err(e) = self
            .radio
            .connect(ssid, password, best.as_ref().map(|e| e.bssid))
            .await
        {
            warn!("association request failed: {}", e);
            self.disconnect_quietly().await;
            return None;
        }

        for _ in 0..retries {
            p.feed();
            if self.radio.is_connected() {
                return Some(self.on_associated(ssid, best.as_ref()).await);
            }
            delay_fed(p, ASSOCIATION_POLL_MS).await;
        }

        info!("{=str} did not associate, disconnecting", ssid);
        self.disconnect_quietly().await;
        None
    }

    async fn on_associated(
        &mut self,
        ssid: &str,
        best: Option<&ScanEntry>,
    ) -> LinkInfo {
        self.associations += 1;
        self.link = LinkState::Associated;

        let mut name = String::new();
        let _ = name.push_str(ssid);
        let info = LinkInfo {
            ip: self.radio.ip_config().unwrap_or_default(),
            ssid: name,
            bssid: best.map(|e| e.bssid),
            channel: best.map(|e| e.channel).unwrap_or(0),
            rssi: self.radio.rssi().await,
            reconnects: self.associations.saturating_sub(1),
        };
        info!(
            "associated with {=str}, ip {=[u8]}",
            ssid,
            &info.ip.address[..]
        );
        self.link_info = Some(info.clone());
        info
    }

    async fn disconnect_quietly(&mut self) {
        if let Err(e) = self.radio.disconnect().await {
            warn!("disconnect failed: {}", e);
        }
    }

    /// Bring the session up if it is down
    ///
    /// Registers the last will, connects, publishes presence and subscribes
    /// to the control topic.
    pub async fn ensure_session<P: Platform>(
        &mut self,
        p: &mut P,
        timeout_ms: u32,
    ) -> Result<(), SessionError> {
        p.feed();

        if self.link != LinkState::Associated || !self.radio.is_connected() {
            self.session = SessionState::NoSession;
            return Err(SessionError::LinkDown);
        }
        if self.session == SessionState::Active {
            return Ok(());
        }

        self.session = SessionState::Connecting;
        let config = self.config;
        let mqtt = &config.mqtt;
        let client_id = self.identity.client_id.clone();
        let lwt = self.topics.lwt.clone();
        let options = ConnectOptions {
            client_id: &client_id,
            host: &mqtt.host,
            port: mqtt.port,
            username: mqtt.username.as_deref(),
            password: mqtt.password.as_deref(),
            keepalive_s: mqtt.keepalive_s,
            will: Some(LastWill {
                topic: &lwt,
                payload: PRESENCE_OFFLINE,
                qos: QoS::AtMostOnce,
                retain: true,
            }),
            timeout_ms,
        };

        info!(
            "connecting to {=str}:{=u16} as {=str}",
            options.host,
            options.port,
            options.client_id
        );
        let result = self.open_session(p, &options).await;
        match result {
            Ok(()) => {
                self.session = SessionState::Active;
                self.last_ping = p.now_ms();
                info!("session active");
                Ok(())
            }
            Err(e) => {
                self.session = SessionState::NoSession;
                Err(e)
            }
        }
    }

    async fn open_session<P: Platform>(
        &mut self,
        p: &mut P,
        options: &ConnectOptions<'_>,
    ) -> Result<(), SessionError> {
        self.client
            .connect(options)
            .await
            .map_err(SessionError::Connect)?;
        p.feed();

        self.client
            .publish(&self.topics.lwt, PRESENCE_ONLINE, QoS::AtMostOnce, true)
            .await
            .map_err(SessionError::Presence)?;
        p.feed();

        self.client
            .subscribe(&self.topics.control, QoS::AtMostOnce)
            .await
            .map_err(SessionError::Subscribe)?;
        p.feed();

        self.discard_replayed(p)
            .await
            .map_err(SessionError::Subscribe)
    }

    /// Drop what the broker replays right after the subscription
    ///
    /// A fresh subscription is answered with the retained control message,
    /// which the client may not flag as retained.
    async fn discard_replayed<P: Platform>(&mut self, p: &mut P) -> Result<(), ClientError> {
        for _ in 0..MAX_POLLS_PER_CHECK {
            match self.client.poll_once().await? {
                Some(message) => {
                    warn!(
                        "discarding replayed message on {=str}",
                        message.topic.as_str()
                    );
                    p.feed();
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Publish on the active session
    pub async fn publish<P: Platform>(
        &mut self,
        p: &mut P,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SupervisorError> {
        p.feed();
        if self.session != SessionState::Active {
            return Err(SupervisorError::Client(ClientError::NotConnected));
        }
        match self.client.publish(topic, payload, qos, retain).await {
            Ok(()) => {
                self.last_ping = p.now_ms();
                p.feed();
                Ok(())
            }
            Err(e) => {
                self.session = SessionState::NoSession;
                Err(SupervisorError::Client(e))
            }
        }
    }

    /// Sleep the cooldown, then restart the board
    async fn restart_after<P: Platform>(&mut self, p: &mut P, cooldown_s: u16) -> SupervisorError {
        warn!("restarting in {=u16} s", cooldown_s);
        delay_fed(p, u32::from(cooldown_s) * 1000).await;
        p.restart();
        SupervisorError::Restarting
    }

    /// [`Self::ensure_link`], restarting the board on failure
    pub async fn ensure_link_catch_reset<P: Platform>(
        &mut self,
        p: &mut P,
    ) -> Result<LinkInfo, SupervisorError> {
        match self.ensure_link(p).await {
            Ok(info) => Ok(info),
            Err(e) => {
                error!("link failed: {}", e);
                Err(self.restart_after(p, self.config.safety.link_cooldown_s).await)
            }
        }
    }

    /// [`Self::ensure_session`], restarting the board on failure
    pub async fn ensure_session_catch_reset<P: Platform>(
        &mut self,
        p: &mut P,
        timeout_ms: u32,
    ) -> Result<(), SupervisorError> {
        match self.ensure_session(p, timeout_ms).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("session failed: {}", e);
                Err(self.restart_after(p, self.config.safety.session_cooldown_s).await)
            }
        }
    }

    /// Broker connect timeout, kept inside the watchdog window
    pub fn session_timeout_ms(&self) -> u32 {
        let configured = u32::from(self.config.mqtt.connect_timeout_s) * 1000;
        let safety = &self.config.safety;
        if safety.enable_watchdog {
            configured.min(safety.watchdog_timeout_ms.saturating_sub(WATCHDOG_MARGIN_MS))
        } else {
            configured
        }
    }

    /// Link and session together, restarting on failure
    pub async fn ensure_online_catch_reset<P: Platform>(
        &mut self,
        p: &mut P,
    ) -> Result<(), SupervisorError> {
        self.ensure_link_catch_reset(p).await?;
        let timeout_ms = self.session_timeout_ms();
        self.ensure_session_catch_reset(p, timeout_ms).await
    }

    /// [`Self::publish`], restarting the board on failure when configured
    pub async fn publish_catch_reset<P: Platform>(
        &mut self,
        p: &mut P,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SupervisorError> {
        match self.publish(p, topic, payload, qos, retain).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("publish to {=str} failed: {}", topic, e);
                if self.config.safety.reset_on_publish_failure {
                    Err(self.restart_after(p, self.config.safety.publish_cooldown_s).await)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Milliseconds since the supervisor was created
    pub fn uptime_ms(&self, now: Millis) -> Millis {
        now.saturating_sub(self.boot_ms)
    }
}
