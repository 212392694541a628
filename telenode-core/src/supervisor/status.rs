//! Session upkeep: status reports, inbound messages and keepalive

use crate::commands::CommandQueue;
use crate::payload::{
    created_at, envelope, format_ipv4, format_mac, ScanListView, StatusReport, WifiConfigStatus,
    WifiStatus,
};
use crate::time::{iso8601, TimeZone};
use crate::traits::{IpConfig, Platform, PubSubClient, QoS, Radio};
use crate::Millis;

use super::{
    LinkState, SessionState, Supervisor, SupervisorError, MAX_POLLS_PER_CHECK, PING_MARGIN_MS,
    PRESENCE_ONLINE,
};

/// Snapshot returned by [`Supervisor::get_link_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkStatus {
    pub link: LinkState,
    pub session: SessionState,
    /// The radio reports an association right now
    pub connected: bool,
    pub ip: Option<IpConfig>,
}

impl<R: Radio, C: PubSubClient> Supervisor<'_, R, C> {
    /// Current link and session state, without side effects on either
    pub fn get_link_status(&mut self) -> LinkStatus {
        LinkStatus {
            link: self.link,
            session: self.session,
            connected: self.radio.is_connected(),
            ip: self.radio.ip_config(),
        }
    }

    /// Periodic session upkeep
    ///
    /// Sends the status report when it is due, hands control-topic
    /// messages to `queue`, and pings when the keepalive deadline nears.
    pub async fn check_messages<P: Platform>(
        &mut self,
        p: &mut P,
        queue: &mut CommandQueue,
    ) -> Result<(), SupervisorError> {
        p.feed();

        let now = p.now_ms();
        let due = self
            .last_status
            .map_or(true, |at| now.saturating_sub(at) > self.config.period_ms());
        if due {
            self.send_status(p).await?;
        }

        for _ in 0..MAX_POLLS_PER_CHECK {
            let message = match self.client.poll_once().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    self.session = SessionState::NoSession;
                    return Err(SupervisorError::Client(e));
                }
            };
            p.feed();

            let now = p.now_ms();
            self.last_ping = now;
            if message.topic == self.topics.control {
                queue.on_message(&message.payload, message.retained, now);
            } else {
                debug!("message on unexpected topic {=str}", message.topic.as_str());
            }
        }

        self.ping_if_needed(p).await
    }

    /// Ping when the last broker round trip is older than keepalive minus margin
    pub async fn ping_if_needed<P: Platform>(&mut self, p: &mut P) -> Result<(), SupervisorError> {
        let keepalive_ms = Millis::from(self.config.mqtt.keepalive_s) * 1000;
        let now = p.now_ms();
        if now.saturating_sub(self.last_ping) <= keepalive_ms.saturating_sub(PING_MARGIN_MS) {
            return Ok(());
        }

        debug!("ping");
        match self.client.ping().await {
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

    /// Publish the status report, then refresh the presence message
    pub async fn send_status<P: Platform>(&mut self, p: &mut P) -> Result<(), SupervisorError> {
        let config = self.config;
        let now = p.now_ms();
        let runtime_s = self.uptime_ms(now) / 1000;

        let running_since = match p.unix_time() {
            Some(unix) => iso8601(unix - runtime_s as i64, config.timezone),
            None => iso8601(0, TimeZone::Utc),
        };

        let reboot_pending_in = match config.safety.restart_after_s {
            0 => -1,
            after => i64::from(after) - runtime_s as i64,
        };

        let ip = self.radio.ip_config().unwrap_or_default();
        let info = self.link_info.clone().unwrap_or_default();
        let wifi = WifiStatus {
            ip: format_ipv4(ip.address),
            subnet: format_ipv4(ip.netmask()),
            gateway: ip.gateway.map(format_ipv4),
            dns: ip.dns.map(format_ipv4),
            strength: self.radio.rssi().await,
            config: WifiConfigStatus {
                mac: format_mac(&self.identity.mac, Some(':')),
                ssid: info.ssid,
                channel: info.channel,
                reconnects: info.reconnects,
                hostname: self.identity.hostname.clone(),
            },
        };

        // The scan from the last association is reported once
        let scan = self.last_scan.take();
        let report = StatusReport {
            wifi: &wifi,
            wifi_scan: scan.as_deref().map(ScanListView),
            runtime_seconds: runtime_s,
            running_since: &running_since,
            reboot_pending_in,
        };
        let stamp = created_at(&*p, config.timezone);
        let payload =
            envelope(&config.location, &stamp, &report).map_err(|_| SupervisorError::Payload)?;

        let status_topic = self.topics.status.clone();
        let lwt_topic = self.topics.lwt.clone();
        self.publish(p, &status_topic, payload.as_bytes(), QoS::AtLeastOnce, true)
            .await?;
        self.last_status = Some(now);
        info!("status sent, up {=u64} s", runtime_s);

        self.publish(p, &lwt_topic, PRESENCE_ONLINE, QoS::AtLeastOnce, true)
            .await
    }

    /// [`Self::check_messages`], restarting the board on failure
    pub async fn check_messages_catch_reset<P: Platform>(
        &mut self,
        p: &mut P,
        queue: &mut CommandQueue,
    ) -> Result<(), SupervisorError> {
        match self.check_messages(p, queue).await {
            Ok(()) => Ok(()),
            Err(SupervisorError::Restarting) => Err(SupervisorError::Restarting),
            Err(e) => {
                error!("session upkeep failed: {}", e);
                Err(self.restart_after(p, self.config.safety.publish_cooldown_s).await)
            }
        }
    }
}
