//! Telemetry scheduler
//!
//! The node context (supervisor, sensors, command queue) lives behind one
//! async mutex. Timer-driven entry points take it with `try_lock` and skip
//! their run when it is held; the startup measurement and the reboot path
//! wait for it.
//!
//! Each channel runs through the same cycle on every tick:
//!
//! ```text
//! Idle ──► Sampling ──► Deciding ──► Publishing ──► Idle
//!              │            │
//!              └─ error ────┴─ skip ──────────────► Idle
//! ```
//!
//! Commands queued while polling the control topic are dispatched after
//! the telemetry work of the same lock scope.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use heapless::{String, Vec};

use crate::commands::{Command, CommandQueue};
use crate::config::{ConfigError, TelemetryConfig, TopicString, MAX_ENVIRONMENTAL, MAX_LABEL_LEN};
use crate::payload::{created_at, envelope};
use crate::policy::{decide, LastSent, SendTrigger};
use crate::sample::{EnvironmentalReading, Reading, Sample};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::traits::{
    delay_fed, ElectricalSensor, EnvironmentalSensor, Platform, PubSubClient, QoS, Radio,
    SensorError,
};
use crate::Millis;

/// Label of the current/power channel in logs
pub const ELECTRICAL_CHANNEL: &str = "electrical";

/// Where a channel is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    #[default]
    Idle,
    Sampling,
    Deciding,
    Publishing,
}

/// Scheduler failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedulerError {
    /// Another entry point holds the node; this run was skipped
    LockBusy,
    /// A restart was requested; the caller must stop
    Restarting,
    Supervisor(SupervisorError),
}

impl From<SupervisorError> for SchedulerError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::Restarting => SchedulerError::Restarting,
            e => SchedulerError::Supervisor(e),
        }
    }
}

/// What one run did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickReport {
    pub sampled: u8,
    pub sent: u8,
    /// Channels whose sampling or publishing failed
    pub failed: u8,
}

/// One sensor with its topics and send history
pub struct Channel<S> {
    sensor: S,
    name: String<MAX_LABEL_LEN>,
    /// Topics of the two scalar quantities, in reading order
    topics: [TopicString; 2],
    last_sent: Option<LastSent>,
    state: ChannelState,
}

impl<S> Channel<S> {
    fn new(sensor: S, name: &str, topics: [TopicString; 2]) -> Self {
        let mut label = String::new();
        let _ = label.push_str(name);
        Self {
            sensor,
            name: label,
            topics,
            last_sent: None,
            state: ChannelState::Idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &[TopicString; 2] {
        &self.topics
    }

    pub fn last_sent(&self) -> Option<&LastSent> {
        self.last_sent.as_ref()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }
}

/// Everything guarded by the node lock
pub struct Node<'a, R, C, E, V> {
    supervisor: Supervisor<'a, R, C>,
    commands: CommandQueue,
    electrical: Option<Channel<E>>,
    environmental: Vec<Channel<V>, MAX_ENVIRONMENTAL>,
}

impl<'a, R, C, E, V> Node<'a, R, C, E, V>
where
    R: Radio,
    C: PubSubClient,
    E: ElectricalSensor,
    V: EnvironmentalSensor,
{
    /// Assemble the node
    ///
    /// Environmental sensors are matched to the configured channels in
    /// order; the counts must agree.
    pub fn new(
        supervisor: Supervisor<'a, R, C>,
        electrical: Option<E>,
        environmental: impl IntoIterator<Item = V>,
    ) -> Result<Self, ConfigError> {
        let config = supervisor.config();

        let electrical = electrical.map(|sensor| {
            let topics = supervisor.topics();
            Channel::new(
                sensor,
                ELECTRICAL_CHANNEL,
                [topics.current.clone(), topics.bus_voltage.clone()],
            )
        });

        let mismatch = ConfigError::Invalid {
            field: "environmental",
            reason: "sensor count does not match configured channels",
        };
        let mut channels = Vec::new();
        let mut sensors = environmental.into_iter();
        for entry in config.environmental.iter() {
            let sensor = sensors.next().ok_or(mismatch.clone())?;
            let t = &config.mqtt.topics;
            let topics = [
                supervisor.sensor_topic(&t.temperature, &entry.name)?,
                supervisor.sensor_topic(&t.humidity, &entry.name)?,
            ];
            channels
                .push(Channel::new(sensor, &entry.name, topics))
                .map_err(|_| mismatch.clone())?;
        }
        if sensors.next().is_some() {
            return Err(mismatch);
        }

        Ok(Self {
            supervisor,
            commands: CommandQueue::new(),
            electrical,
            environmental: channels,
        })
    }

    pub fn supervisor(&self) -> &Supervisor<'a, R, C> {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut Supervisor<'a, R, C> {
        &mut self.supervisor
    }

    pub fn commands(&self) -> &CommandQueue {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut CommandQueue {
        &mut self.commands
    }

    pub fn electrical(&self) -> Option<&Channel<E>> {
        self.electrical.as_ref()
    }

    pub fn electrical_mut(&mut self) -> Option<&mut Channel<E>> {
        self.electrical.as_mut()
    }

    pub fn environmental(&self) -> &[Channel<V>] {
        &self.environmental
    }

    pub fn environmental_mut(&mut self) -> &mut [Channel<V>] {
        &mut self.environmental
    }

    fn offline(&self) -> bool {
        self.supervisor.config().safety.disable_inet
    }

    /// Bring the network up unless running offline
    async fn ensure_online<P: Platform>(&mut self, p: &mut P) -> Result<(), SchedulerError> {
        if self.offline() {
            return Ok(());
        }
        Ok(self.supervisor.ensure_online_catch_reset(p).await?)
    }

    /// One scheduler run with the lock held: network, telemetry, commands
    pub async fn run<P: Platform>(
        &mut self,
        p: &mut P,
        trigger: SendTrigger,
    ) -> Result<TickReport, SchedulerError> {
        self.ensure_online(p).await?;
        let report = self.measure(p, trigger).await?;
        self.dispatch_commands(p).await?;
        Ok(report)
    }

    /// Sample every channel and send what the policy selects
    pub async fn measure<P: Platform>(
        &mut self,
        p: &mut P,
        trigger: SendTrigger,
    ) -> Result<TickReport, SchedulerError> {
        let now = p.now_ms();
        let mut report = TickReport::default();
        let telemetry = &self.supervisor.config().telemetry;

        if let Some(channel) = self.electrical.as_mut() {
            channel.state = ChannelState::Sampling;
            p.feed();
            match sample_electrical(&mut channel.sensor, p, telemetry).await {
                Ok(reading) => {
                    report.sampled += 1;
                    let sample = Sample::new(now, Reading::Electrical(reading));
                    process(&mut self.supervisor, channel, p, sample, now, trigger, &mut report)
                        .await?;
                }
                Err(e) => {
                    warn!("{=str}: sampling failed: {}", channel.name.as_str(), e);
                    channel.state = ChannelState::Idle;
                    report.failed += 1;
                }
            }
        }

        for channel in self.environmental.iter_mut() {
            channel.state = ChannelState::Sampling;
            p.feed();
            match channel.sensor.measure().await {
                Ok((temperature, humidity)) => {
                    report.sampled += 1;
                    let reading = EnvironmentalReading {
                        temperature,
                        humidity,
                        measure_device_name: channel.name.clone(),
                    };
                    let sample = Sample::new(now, Reading::Environmental(reading));
                    process(&mut self.supervisor, channel, p, sample, now, trigger, &mut report)
                        .await?;
                }
                Err(e) => {
                    warn!("{=str}: sampling failed: {}", channel.name.as_str(), e);
                    channel.state = ChannelState::Idle;
                    report.failed += 1;
                }
            }
        }

        p.feed();
        debug!(
            "measured {=u8}, sent {=u8}, failed {=u8}",
            report.sampled,
            report.sent,
            report.failed
        );
        Ok(report)
    }

    /// Session upkeep followed by command dispatch
    pub async fn check<P: Platform>(&mut self, p: &mut P) -> Result<(), SchedulerError> {
        if !self.offline() {
            self.ensure_online(p).await?;
            self.supervisor
                .check_messages_catch_reset(p, &mut self.commands)
                .await?;
        }
        self.dispatch_commands(p).await
    }

    /// Execute queued commands in arrival order
    pub async fn dispatch_commands<P: Platform>(
        &mut self,
        p: &mut P,
    ) -> Result<(), SchedulerError> {
        while let Some(entry) = self.commands.pop_next() {
            p.feed();
            match entry.to_command() {
                Command::Reboot => {
                    info!("reboot requested");
                    self.reboot(p).await;
                    return Err(SchedulerError::Restarting);
                }
                Command::SwitchAp => info!("switchap: nothing to do"),
                Command::RescanWifi => info!("rescanwifi: nothing to do"),
                Command::Measure(mask) => {
                    let trigger = mask.map_or(SendTrigger::FORCED, SendTrigger::from_arg);
                    self.measure(p, trigger).await?;
                }
                Command::Unknown => {
                    warn!("unknown command {=str}", entry.command.as_str());
                }
            }
        }
        Ok(())
    }

    /// Announce the restart on the logging topic, then restart
    ///
    /// The announcement is best effort; the restart happens regardless.
    pub async fn reboot<P: Platform>(&mut self, p: &mut P) {
        let config = self.supervisor.config();
        let stamp = created_at(&*p, config.timezone);
        let mut message: String<48> = String::new();
        let _ = message.push_str("rebooting at ");
        let _ = message.push_str(&stamp);

        if !self.offline() {
            match envelope(&config.location, &stamp, message.as_str()) {
                Ok(payload) => {
                    let topic = self.supervisor.topics().logging.clone();
                    if let Err(e) = self
                        .supervisor
                        .publish(p, &topic, payload.as_bytes(), QoS::AtLeastOnce, true)
                        .await
                    {
                        warn!("reboot notice not sent: {}", e);
                    }
                }
                Err(_) => warn!("reboot notice not encoded"),
            }
        }

        warn!("{=str}", message.as_str());
        p.feed();
        p.restart();
    }
}

/// Wait for a fresh conversion, let it settle, then read it
async fn sample_electrical<S: ElectricalSensor, P: Platform>(
    sensor: &mut S,
    p: &mut P,
    telemetry: &TelemetryConfig,
) -> Result<crate::sample::ElectricalReading, SensorError> {
    let mut ready = false;
    for _ in 0..telemetry.conversion_poll_limit {
        p.feed();
        if sensor.is_conversion_ready().await? {
            ready = true;
            break;
        }
        p.delay_ms(telemetry.conversion_poll_interval_ms).await;
    }
    if !ready {
        return Err(SensorError::NotReady);
    }

    delay_fed(p, telemetry.conversion_settle_ms).await;
    sensor.read().await
}

/// Decide on a sample and publish it when selected
///
/// Only a restart request is returned as an error; anything else is
/// logged and the channel goes back to idle.
async fn process<S, R, C, P>(
    supervisor: &mut Supervisor<'_, R, C>,
    channel: &mut Channel<S>,
    p: &mut P,
    sample: Sample,
    now: Millis,
    trigger: SendTrigger,
    report: &mut TickReport,
) -> Result<(), SchedulerError>
where
    R: Radio,
    C: PubSubClient,
    P: Platform,
{
    let config = supervisor.config();
    channel.state = ChannelState::Deciding;
    let decision = decide(
        &sample,
        channel.last_sent.as_ref(),
        now,
        config.period_ms(),
        trigger,
    );
    if !decision.send {
        trace!("{=str}: nothing to send", channel.name.as_str());
        channel.state = ChannelState::Idle;
        return Ok(());
    }
    debug!("{=str}: sending ({})", channel.name.as_str(), decision.reason);

    channel.state = ChannelState::Publishing;
    let result = if config.safety.disable_inet {
        info!("{=str}: offline, sample not published", channel.name.as_str());
        Ok(())
    } else {
        publish_sample(supervisor, &channel.topics, p, &sample).await
    };
    channel.last_sent = Some(LastSent { sample, at: now });
    channel.state = ChannelState::Idle;

    match result {
        Ok(()) => {
            report.sent += 1;
            Ok(())
        }
        Err(SupervisorError::Restarting) => Err(SchedulerError::Restarting),
        Err(e) => {
            error!("{=str}: publish failed: {}", channel.name.as_str(), e);
            report.failed += 1;
            Ok(())
        }
    }
}

/// Fan a sample out to its scalar topics and the logging topic
async fn publish_sample<R, C, P>(
    supervisor: &mut Supervisor<'_, R, C>,
    topics: &[TopicString; 2],
    p: &mut P,
    sample: &Sample,
) -> Result<(), SupervisorError>
where
    R: Radio,
    C: PubSubClient,
    P: Platform,
{
    let config = supervisor.config();
    let stamp = created_at(&*p, config.timezone);
    let values = match &sample.reading {
        Reading::Electrical(r) => [r.current_ma, r.bus_voltage_v],
        Reading::Environmental(r) => [r.temperature, r.humidity],
    };

    for (topic, value) in topics.iter().zip(values) {
        let payload = envelope(&config.location, &stamp, &value)
            .map_err(|_| SupervisorError::Payload)?;
        supervisor
            .publish_catch_reset(p, topic, payload.as_bytes(), QoS::AtLeastOnce, true)
            .await?;
    }

    let payload = envelope(&config.location, &stamp, &sample.reading)
        .map_err(|_| SupervisorError::Payload)?;
    let logging = supervisor.topics().logging.clone();
    supervisor
        .publish_catch_reset(p, &logging, payload.as_bytes(), QoS::AtLeastOnce, true)
        .await
}

/// Timer tick: run with trigger bits `arg`, or skip if the node is busy
pub async fn tick<M, R, C, E, V, P>(
    node: &Mutex<M, Node<'_, R, C, E, V>>,
    p: &mut P,
    arg: u8,
) -> Result<TickReport, SchedulerError>
where
    M: RawMutex,
    R: Radio,
    C: PubSubClient,
    E: ElectricalSensor,
    V: EnvironmentalSensor,
    P: Platform,
{
    p.feed();
    let Ok(mut guard) = node.try_lock() else {
        debug!("tick skipped, node busy");
        return Err(SchedulerError::LockBusy);
    };
    guard.run(p, SendTrigger::from_arg(arg)).await
}

/// Run once with trigger bits `arg`, waiting for the lock
pub async fn measure_now<M, R, C, E, V, P>(
    node: &Mutex<M, Node<'_, R, C, E, V>>,
    p: &mut P,
    arg: u8,
) -> Result<TickReport, SchedulerError>
where
    M: RawMutex,
    R: Radio,
    C: PubSubClient,
    E: ElectricalSensor,
    V: EnvironmentalSensor,
    P: Platform,
{
    p.feed();
    let mut guard = node.lock().await;
    guard.run(p, SendTrigger::from_arg(arg)).await
}

/// Control-channel timer: status, inbound messages, keepalive, commands
pub async fn check_messages<M, R, C, E, V, P>(
    node: &Mutex<M, Node<'_, R, C, E, V>>,
    p: &mut P,
) -> Result<(), SchedulerError>
where
    M: RawMutex,
    R: Radio,
    C: PubSubClient,
    E: ElectricalSensor,
    V: EnvironmentalSensor,
    P: Platform,
{
    p.feed();
    let Ok(mut guard) = node.try_lock() else {
        debug!("message check skipped, node busy");
        return Err(SchedulerError::LockBusy);
    };
    guard.check(p).await
}

/// Scheduled or requested restart, waiting for the lock
pub async fn reboot<M, R, C, E, V, P>(node: &Mutex<M, Node<'_, R, C, E, V>>, p: &mut P)
where
    M: RawMutex,
    R: Radio,
    C: PubSubClient,
    E: ElectricalSensor,
    V: EnvironmentalSensor,
    P: Platform,
{
    p.feed();
    let mut guard = node.lock().await;
    guard.reboot(p).await;
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::config::NodeConfig;
    use crate::policy::{ENABLED_BIT, FORCED_BIT};
    use crate::testing::{
        electrical, test_config, test_config_with_environmental, FakeClient, FakeElectrical,
        FakeEnvironmental, FakePlatform, FakeRadio,
    };
    use crate::traits::{Clock, NoEnvironmentalSensor};

    type TestNode<'a> = Node<'a, FakeRadio, FakeClient, FakeElectrical, FakeEnvironmental>;
    type TestMutex<'a> = Mutex<NoopRawMutex, TestNode<'a>>;

    const AP: [u8; 6] = [0x02, 0, 0, 0, 0, 1];

    fn node(config: &NodeConfig, sensor: FakeElectrical) -> TestMutex<'_> {
        let supervisor = Supervisor::new(
            config,
            FakeRadio::with_ap("attic", AP, -55),
            FakeClient::new(),
            0,
        )
        .unwrap();
        Mutex::new(Node::new(supervisor, Some(sensor), []).unwrap())
    }

    fn published_on(node: &mut TestNode<'_>, suffix: &str) -> usize {
        node.supervisor().client().on_topic(suffix).len()
    }

    #[test]
    fn test_three_tick_scenario() {
        let config = test_config();
        let sensor = FakeElectrical::with(&[
            electrical(0.4, 5.0),
            electrical(0.4, 5.0),
            electrical(0.45, 5.0),
        ]);
        let node = node(&config, sensor);
        let mut p = FakePlatform::new();

        // Neither enabled nor forced, no history
        let report = block_on(tick(&node, &mut p, 0)).unwrap();
        assert_eq!(report.sampled, 1);
        assert_eq!(report.sent, 0);
        {
            let mut n = node.try_lock().unwrap();
            assert!(n.electrical().unwrap().last_sent().is_none());
            assert_eq!(published_on(&mut n, "/current"), 0);
        }

        // 70 s later with periodic sends enabled: overdue
        p.advance(70_000);
        let tick2 = p.now_ms();
        let report = block_on(tick(&node, &mut p, ENABLED_BIT)).unwrap();
        assert_eq!(report.sent, 1);
        {
            let mut n = node.try_lock().unwrap();
            let last = n.electrical().unwrap().last_sent().unwrap();
            assert_eq!(last.at, tick2);
            assert_eq!(last.sample.timestamp, tick2);
            assert_eq!(published_on(&mut n, "/current"), 1);
            assert_eq!(published_on(&mut n, "/busvoltage"), 1);
            assert_eq!(published_on(&mut n, "/logging"), 1);
        }

        // 5 s later: 0.05 over a 0.04 threshold
        p.advance(5_000);
        let report = block_on(tick(&node, &mut p, ENABLED_BIT)).unwrap();
        assert_eq!(report.sent, 1);
        let mut n = node.try_lock().unwrap();
        assert_eq!(published_on(&mut n, "/current"), 2);
        assert_eq!(n.electrical().unwrap().state(), ChannelState::Idle);
    }

    #[test]
    fn test_small_change_not_sent() {
        let config = test_config();
        let sensor = FakeElectrical::with(&[electrical(0.4, 5.0), electrical(0.43, 5.0)]);
        let node = node(&config, sensor);
        let mut p = FakePlatform::new();

        block_on(tick(&node, &mut p, ENABLED_BIT)).unwrap();
        p.advance(5_000);
        let report = block_on(tick(&node, &mut p, ENABLED_BIT)).unwrap();
        assert_eq!(report.sent, 0);
    }

    #[test]
    fn test_fan_out_payloads() {
        let config = test_config();
        let node = node(&config, FakeElectrical::with(&[electrical(12.5, 5.0)]));
        let mut p = FakePlatform::new();
        p.unix = Some(1_714_564_800);

        block_on(tick(&node, &mut p, FORCED_BIT)).unwrap();
        let n = node.try_lock().unwrap();
        let client = n.supervisor().client();

        let current = client.on_topic("/current");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].qos, QoS::AtLeastOnce);
        assert!(current[0].retain);
        let json: serde_json::Value = serde_json::from_str(&current[0].payload).unwrap();
        assert_eq!(json["value"], 12.5);
        assert_eq!(json["created_at"], "2024-05-01T12:00:00+00:00");
        assert_eq!(json["lat"], 52.5);

        let logging = client.on_topic("/logging");
        let json: serde_json::Value = serde_json::from_str(&logging[0].payload).unwrap();
        assert_eq!(json["value"]["current"], 12.5);
        assert_eq!(json["value"]["busvoltage"], 5.0);
    }

    #[test]
    fn test_environmental_channel_topics() {
        let config = test_config_with_environmental("dht22");
        let supervisor = Supervisor::new(
            &config,
            FakeRadio::with_ap("attic", AP, -55),
            FakeClient::new(),
            0,
        )
        .unwrap();
        let mut env = FakeEnvironmental::default();
        env.values.push_back(Ok((21.5, 40.0)));
        let node: TestMutex<'_> = Mutex::new(Node::new(supervisor, None, [env]).unwrap());
        let mut p = FakePlatform::new();

        block_on(tick(&node, &mut p, ENABLED_BIT)).unwrap();
        let n = node.try_lock().unwrap();
        assert_eq!(n.environmental()[0].name(), "dht22");
        let client = n.supervisor().client();
        let temperature = client.on_topic("/dht22/temperature");
        assert_eq!(temperature.len(), 1);
        assert!(temperature[0].payload.contains(r#""value":21.5"#));
        assert_eq!(client.on_topic("/dht22/humidity").len(), 1);
        let logging = client.on_topic("/logging");
        assert!(logging[0].payload.contains(r#""measure_device_name":"dht22""#));
    }

    #[test]
    fn test_environmental_count_must_match() {
        let config = test_config_with_environmental("dht22");
        let supervisor = Supervisor::new(
            &config,
            FakeRadio::new(),
            FakeClient::new(),
            0,
        )
        .unwrap();
        let result: Result<Node<'_, _, _, FakeElectrical, NoEnvironmentalSensor>, _> =
            Node::new(supervisor, None, []);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "environmental",
                ..
            })
        ));
    }

    #[test]
    fn test_tick_skipped_while_locked() {
        let config = test_config();
        let node = node(&config, FakeElectrical::with(&[electrical(1.0, 5.0)]));
        let mut p = FakePlatform::new();

        let guard = node.try_lock().unwrap();
        assert_eq!(
            block_on(tick(&node, &mut p, FORCED_BIT)),
            Err(SchedulerError::LockBusy)
        );
        assert_eq!(
            block_on(check_messages(&node, &mut p)),
            Err(SchedulerError::LockBusy)
        );
        drop(guard);

        let report = block_on(tick(&node, &mut p, FORCED_BIT)).unwrap();
        assert_eq!(report.sent, 1);
    }

    #[test]
    fn test_lock_released_after_failed_publish() {
        let config = test_config();
        let node = node(&config, FakeElectrical::with(&[electrical(1.0, 5.0)]));
        let mut p = FakePlatform::new();
        block_on(measure_now(&node, &mut p, 0)).unwrap();

        node.try_lock().unwrap().supervisor_mut().client_mut().fail_publishes = 1;
        let result = block_on(tick(&node, &mut p, FORCED_BIT));
        assert_eq!(result, Err(SchedulerError::Restarting));
        assert_eq!(p.restarts, 1);

        let n = node.try_lock().unwrap();
        let channel = n.electrical().unwrap();
        assert_eq!(channel.state(), ChannelState::Idle);
        // The attempt counts as sent
        assert!(channel.last_sent().is_some());
    }

    #[test]
    fn test_failed_publish_without_reset_keeps_running() {
        let mut config = test_config();
        config.safety.reset_on_publish_failure = false;
        let node = node(&config, FakeElectrical::with(&[electrical(1.0, 5.0)]));
        let mut p = FakePlatform::new();
        block_on(measure_now(&node, &mut p, 0)).unwrap();

        node.try_lock().unwrap().supervisor_mut().client_mut().fail_publishes = 1;
        let report = block_on(tick(&node, &mut p, FORCED_BIT)).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(p.restarts, 0);
        assert!(node.try_lock().is_ok());
    }

    #[test]
    fn test_conversion_polling_is_bounded() {
        let config = test_config();
        let mut sensor = FakeElectrical::with(&[electrical(1.0, 5.0)]);
        sensor.not_ready_polls = 3;
        let node = node(&config, sensor);
        let mut p = FakePlatform::new();

        let report = block_on(tick(&node, &mut p, FORCED_BIT)).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(p.delays, std::vec![20, 20, 20, 200]);

        node.try_lock()
            .unwrap()
            .electrical_mut()
            .unwrap()
            .sensor_mut()
            .not_ready_polls = 1_000;
        let report = block_on(tick(&node, &mut p, FORCED_BIT)).unwrap();
        assert_eq!(report.failed, 1);
        let mut n = node.try_lock().unwrap();
        let sensor = n.electrical_mut().unwrap().sensor_mut();
        assert_eq!(sensor.reads, 1);
        assert_eq!(sensor.ready_checks, 4 + 50);
    }

    #[test]
    fn test_sensor_error_resets_channel() {
        let config = test_config();
        let mut sensor = FakeElectrical::default();
        sensor.readings.push_back(Err(SensorError::RangeOverflow));
        let node = node(&config, sensor);
        let mut p = FakePlatform::new();

        let report = block_on(tick(&node, &mut p, FORCED_BIT)).unwrap();
        assert_eq!(report, TickReport { sampled: 0, sent: 0, failed: 1 });
        let n = node.try_lock().unwrap();
        assert_eq!(n.electrical().unwrap().state(), ChannelState::Idle);
        assert!(n.electrical().unwrap().last_sent().is_none());
    }

    #[test]
    fn test_commands_run_after_telemetry() {
        let config = test_config();
        let node = node(&config, FakeElectrical::with(&[electrical(1.0, 5.0)]));
        let mut p = FakePlatform::new();
        block_on(measure_now(&node, &mut p, 0)).unwrap();

        {
            let mut n = node.try_lock().unwrap();
            let control = n.supervisor().topics().control.clone();
            n.supervisor_mut().client_mut().deliver(&control, "measure", false);
            n.supervisor_mut().client_mut().deliver(&control, "frobnicate", false);
        }
        block_on(check_messages(&node, &mut p)).unwrap();

        let n = node.try_lock().unwrap();
        assert!(n.commands().is_empty());
        // Forced measurement from the command
        assert_eq!(n.supervisor().client().on_topic("/current").len(), 1);
    }

    #[test]
    fn test_reboot_command() {
        let config = test_config();
        let node = node(&config, FakeElectrical::with(&[electrical(1.0, 5.0)]));
        let mut p = FakePlatform::new();
        p.unix = Some(1_714_564_800);
        block_on(measure_now(&node, &mut p, 0)).unwrap();

        node.try_lock()
            .unwrap()
            .commands_mut()
            .on_message(b"reboot", false, 0);
        let result = block_on(tick(&node, &mut p, 0));
        assert_eq!(result, Err(SchedulerError::Restarting));
        assert_eq!(p.restarts, 1);

        let n = node.try_lock().unwrap();
        let logging = n.supervisor().client().on_topic("/logging");
        let notice = logging.last().unwrap();
        assert!(notice
            .payload
            .contains(r#""value":"rebooting at 2024-05-01T12:00:00+00:00""#));
    }

    #[test]
    fn test_reboot_without_session_still_restarts() {
        let config = test_config();
        let node = node(&config, FakeElectrical::default());
        let mut p = FakePlatform::new();

        block_on(reboot(&node, &mut p));
        assert_eq!(p.restarts, 1);
        assert!(node.try_lock().unwrap().supervisor().client().published.is_empty());
    }

    #[test]
    fn test_offline_mode_skips_network() {
        let mut config = test_config();
        config.safety.disable_inet = true;
        let node = node(&config, FakeElectrical::with(&[electrical(1.0, 5.0)]));
        let mut p = FakePlatform::new();

        let report = block_on(tick(&node, &mut p, FORCED_BIT)).unwrap();
        assert_eq!(report.sent, 1);
        block_on(check_messages(&node, &mut p)).unwrap();

        let n = node.try_lock().unwrap();
        assert!(n.supervisor().radio().connects.is_empty());
        assert!(n.supervisor().client().connects.is_empty());
        assert!(n.electrical().unwrap().last_sent().is_some());
    }

    #[test]
    fn test_link_failure_restarts_before_sampling() {
        let config = test_config();
        let supervisor =
            Supervisor::new(&config, FakeRadio::new(), FakeClient::new(), 0).unwrap();
        let node: TestMutex<'_> = Mutex::new(
            Node::new(supervisor, Some(FakeElectrical::with(&[electrical(1.0, 5.0)])), [])
                .unwrap(),
        );
        let mut p = FakePlatform::new();

        assert_eq!(
            block_on(tick(&node, &mut p, FORCED_BIT)),
            Err(SchedulerError::Restarting)
        );
        assert_eq!(p.restarts, 1);
        let mut n = node.try_lock().unwrap();
        assert_eq!(n.electrical_mut().unwrap().sensor_mut().reads, 0);
        assert!(n.supervisor().client().connects.is_empty());
    }
}
