//! rust-mqtt session task and its client handle
//!
//! The MQTT client borrows its socket and packet buffers, so it lives in
//! [`mqtt_task`], which owns them on its own stack. [`BrokerClient`] is the
//! [`PubSubClient`] the supervisor holds; every call is one request on
//! [`REQUESTS`] answered on [`RESPONSES`]. Callers are serialised by the
//! node lock, so at most one request is in flight.
//!
//! The socket sits in a `RefCell` shared by the client's transport and
//! [`poll`]: a poll first waits for the socket to turn readable, which can be
//! abandoned at any point, and only then reads a whole packet. Dropping
//! `receive_message` halfway would desynchronise the MQTT stream.

// The socket is only ever touched from `mqtt_task`, one operation at a time.
#![allow(clippy::await_holding_refcell_ref)]

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::net::Ipv4Addr;

use defmt::*;
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::{IpAddress, Stack};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Instant};
use embedded_io_async::{ErrorType, Read, Write};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;

use telenode_core::traits::{
    ClientError, ConnectOptions, InboundMessage, PubSubClient, QoS, Watchdog,
};

use crate::board::Board;

/// TCP receive window
const TCP_RX_LEN: usize = 1024;

/// TCP send window; status reports with a scan list are the largest packets
const TCP_TX_LEN: usize = 4096;

/// MQTT packet buffers
const MQTT_RECV_LEN: usize = 1024;
const MQTT_WRITE_LEN: usize = 4096;

/// Socket inactivity timeout
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `poll_once` waits for an inbound packet
const POLL_WINDOW: Duration = Duration::from_millis(50);

/// After a subscription, messages arriving this soon are the broker's
/// retained replay
const REPLAY_WINDOW: Duration = Duration::from_secs(1);

/// Upper bound for publish, subscribe, ping and reading one inbound packet
const OPERATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Watchdog feed period while a caller waits on [`mqtt_task`]
const FEED_INTERVAL: Duration = Duration::from_secs(1);

/// MQTT v5 properties per packet
const MAX_PROPERTIES: usize = 5;

type Response = Result<Option<InboundMessage>, ClientError>;

/// Owned copy of [`ConnectOptions`]
struct SessionParams {
    client_id: String,
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    keepalive_s: u16,
    will: Option<(String, Vec<u8>, bool)>,
    timeout_ms: u32,
}

impl From<&ConnectOptions<'_>> for SessionParams {
    fn from(o: &ConnectOptions<'_>) -> Self {
        Self {
            client_id: o.client_id.to_string(),
            host: o.host.to_string(),
            port: o.port,
            username: o.username.map(ToString::to_string),
            password: o.password.map(ToString::to_string),
            keepalive_s: o.keepalive_s,
            will: o
                .will
                .map(|w| (w.topic.to_string(), w.payload.to_vec(), w.retain)),
            timeout_ms: o.timeout_ms,
        }
    }
}

enum Request {
    Connect(SessionParams),
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe(String),
    Poll,
    Ping,
}

/// Requests from [`BrokerClient`] to [`mqtt_task`]
static REQUESTS: Channel<CriticalSectionRawMutex, Request, 1> = Channel::new();

/// Answers from [`mqtt_task`]
static RESPONSES: Signal<CriticalSectionRawMutex, Response> = Signal::new();

/// Transport adapter over a shared embassy-net TCP socket
pub struct EmbassyNetTransport<'s, 'b> {
    socket: &'s RefCell<TcpSocket<'b>>,
}

impl<'s, 'b> EmbassyNetTransport<'s, 'b> {
    pub fn new(socket: &'s RefCell<TcpSocket<'b>>) -> Self {
        Self { socket }
    }
}

impl ErrorType for EmbassyNetTransport<'_, '_> {
    type Error = embassy_net::tcp::Error;
}

impl Read for EmbassyNetTransport<'_, '_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.socket.borrow_mut().read(buf).await
    }
}

impl Write for EmbassyNetTransport<'_, '_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.socket.borrow_mut().write(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.socket.borrow_mut().flush().await
    }
}

type Session<'s, 'b> = MqttClient<'s, EmbassyNetTransport<'s, 'b>, MAX_PROPERTIES, CountingRng>;

fn client_error(reason: ReasonCode) -> ClientError {
    match reason {
        ReasonCode::NetworkError => ClientError::Transport,
        ReasonCode::BadUserNameOrPassword
        | ReasonCode::NotAuthorized
        | ReasonCode::ServerUnavailable
        | ReasonCode::ServerBusy
        | ReasonCode::Banned
        | ReasonCode::ClientIdNotValid => ClientError::Refused,
        _ => ClientError::Protocol,
    }
}

fn mqtt_qos(qos: QoS) -> QualityOfService {
    match qos {
        QoS::AtMostOnce => QualityOfService::QoS0,
        QoS::AtLeastOnce => QualityOfService::QoS1,
    }
}

/// Literal IPv4 first, then DNS
async fn resolve(stack: Stack<'static>, host: &str) -> Result<IpAddress, ClientError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(IpAddress::Ipv4(ip));
    }
    match stack.dns_query(host, DnsQueryType::A).await {
        Ok(addrs) => addrs.first().copied().ok_or_else(|| {
            error!("mqtt: no address for '{=str}'", host);
            ClientError::Transport
        }),
        Err(e) => {
            error!("mqtt: DNS lookup of '{=str}' failed: {:?}", host, e);
            Err(ClientError::Transport)
        }
    }
}

/// Resolve, connect TCP and complete the MQTT handshake
async fn open<'s, 'b>(
    stack: Stack<'static>,
    params: &'s SessionParams,
    socket: &'s RefCell<TcpSocket<'b>>,
    recv: &'s mut [u8],
    write: &'s mut [u8],
) -> Result<Session<'s, 'b>, ClientError> {
    let addr = resolve(stack, &params.host).await?;

    info!("mqtt: connecting TCP to {}:{=u16}", Debug2Format(&addr), params.port);
    socket
        .borrow_mut()
        .connect((addr, params.port))
        .await
        .map_err(|e| {
            error!("mqtt: TCP connect failed: {:?}", e);
            ClientError::Transport
        })?;

    let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20000));
    config.add_client_id(&params.client_id);
    config.keep_alive = params.keepalive_s;
    config.add_max_subscribe_qos(QualityOfService::QoS0);
    config.max_packet_size = MQTT_RECV_LEN as u32;
    if let Some(username) = &params.username {
        config.add_username(username);
    }
    if let Some(password) = &params.password {
        config.add_password(password);
    }
    // Will QoS is fixed by rust-mqtt 0.3
    if let Some((topic, payload, retain)) = &params.will {
        config.add_will(topic, payload, *retain);
    }

    let recv_len = recv.len();
    let write_len = write.len();
    let mut client = MqttClient::<_, MAX_PROPERTIES, _>::new(
        EmbassyNetTransport::new(socket),
        write,
        write_len,
        recv,
        recv_len,
        config,
    );

    client.connect_to_broker().await.map_err(|reason| {
        error!("mqtt: CONNECT rejected: {:?}", Debug2Format(&reason));
        client_error(reason)
    })?;
    info!("mqtt: connected as {=str}", params.client_id.as_str());
    Ok(client)
}

/// Non-blocking receive: `None` when nothing arrives within the window
///
/// Only the readiness wait is bounded by the window. Once bytes are pending
/// the packet is read to the end, and a stall there ends the session.
/// rust-mqtt 0.3 does not expose the RETAIN flag of inbound packets, so
/// messages received before `replay_until` are reported as retained.
async fn poll(
    client: &mut Session<'_, '_>,
    socket: &RefCell<TcpSocket<'_>>,
    replay_until: Option<Instant>,
) -> Response {
    let window = match replay_until {
        Some(until) => until.saturating_duration_since(Instant::now()),
        None => POLL_WINDOW,
    };
    let ready = {
        let socket = socket.borrow();
        with_timeout(window, socket.wait_read_ready()).await
    };
    if ready.is_err() {
        return Ok(None);
    }

    let (topic, payload) = match with_timeout(OPERATION_TIMEOUT, client.receive_message()).await {
        Err(_) => {
            error!("mqtt: inbound packet stalled");
            return Err(ClientError::Timeout);
        }
        Ok(Err(reason)) => return Err(client_error(reason)),
        Ok(Ok(message)) => message,
    };

    let mut inbound = InboundMessage {
        topic: heapless::String::new(),
        payload: heapless::Vec::new(),
        retained: replay_until.is_some(),
    };
    if inbound.topic.push_str(topic).is_err() || inbound.payload.extend_from_slice(payload).is_err()
    {
        warn!("mqtt: dropped oversized message on {=str}", topic);
        return Ok(None);
    }
    Ok(Some(inbound))
}

/// Serve requests on an open session
///
/// Returns the request that ended the session if it was a new connect.
async fn serve(
    client: &mut Session<'_, '_>,
    socket: &RefCell<TcpSocket<'_>>,
) -> Option<SessionParams> {
    let mut replay_until: Option<Instant> = None;
    loop {
        let response = match REQUESTS.receive().await {
            Request::Connect(params) => return Some(params),
            Request::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                match with_timeout(
                    OPERATION_TIMEOUT,
                    client.send_message(&topic, &payload, mqtt_qos(qos), retain),
                )
                .await
                {
                    Err(_) => Err(ClientError::Timeout),
                    Ok(Ok(())) | Ok(Err(ReasonCode::NoMatchingSubscribers)) => Ok(None),
                    Ok(Err(reason)) => Err(client_error(reason)),
                }
            }
            Request::Subscribe(topic) => {
                match with_timeout(OPERATION_TIMEOUT, client.subscribe_to_topic(&topic)).await {
                    Err(_) => Err(ClientError::Timeout),
                    Ok(result) => {
                        replay_until = Some(Instant::now() + REPLAY_WINDOW);
                        result.map(|()| None).map_err(client_error)
                    }
                }
            }
            Request::Poll => {
                replay_until = replay_until.filter(|until| Instant::now() < *until);
                poll(client, socket, replay_until).await
            }
            Request::Ping => match with_timeout(OPERATION_TIMEOUT, client.send_ping()).await {
                Err(_) => Err(ClientError::Timeout),
                Ok(result) => result.map(|()| None).map_err(client_error),
            },
        };

        let failed = response.is_err();
        RESPONSES.signal(response);
        if failed {
            warn!("mqtt: session closed after failed operation");
            return None;
        }
    }
}

/// Owns the socket, the MQTT client and their buffers
#[embassy_executor::task]
pub async fn mqtt_task(stack: Stack<'static>) -> ! {
    let mut tcp_rx = [0u8; TCP_RX_LEN];
    let mut tcp_tx = [0u8; TCP_TX_LEN];
    let mut recv = [0u8; MQTT_RECV_LEN];
    let mut write = [0u8; MQTT_WRITE_LEN];

    let mut pending: Option<SessionParams> = None;
    loop {
        let params = match pending.take() {
            Some(params) => params,
            None => match REQUESTS.receive().await {
                Request::Connect(params) => params,
                _ => {
                    RESPONSES.signal(Err(ClientError::NotConnected));
                    continue;
                }
            },
        };

        let mut socket = TcpSocket::new(stack, &mut tcp_rx, &mut tcp_tx);
        socket.set_timeout(Some(SOCKET_TIMEOUT));
        let socket = RefCell::new(socket);

        let timeout = Duration::from_millis(u64::from(params.timeout_ms));
        let opened = with_timeout(
            timeout,
            open(stack, &params, &socket, &mut recv, &mut write),
        )
        .await;
        match opened {
            Err(_) => {
                error!("mqtt: connect timed out");
                RESPONSES.signal(Err(ClientError::Timeout));
            }
            Ok(Err(e)) => RESPONSES.signal(Err(e)),
            Ok(Ok(mut client)) => {
                RESPONSES.signal(Ok(None));
                pending = serve(&mut client, &socket).await;
            }
        }
    }
}

/// [`PubSubClient`] backed by [`mqtt_task`]
#[derive(Debug, Default)]
pub struct BrokerClient;

impl BrokerClient {
    /// One request and its answer, feeding the watchdog while waiting
    async fn call(&mut self, request: Request) -> Response {
        RESPONSES.reset();
        REQUESTS.send(request).await;
        loop {
            match with_timeout(FEED_INTERVAL, RESPONSES.wait()).await {
                Ok(response) => return response,
                Err(_) => Board.feed(),
            }
        }
    }
}

impl PubSubClient for BrokerClient {
    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), ClientError> {
        self.call(Request::Connect(SessionParams::from(options)))
            .await
            .map(|_| ())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        debug!(
            "mqtt: publish {=str} len={=usize} retain={=bool}",
            topic,
            payload.len(),
            retain
        );
        let request = Request::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        };
        self.call(request).await.map(|_| ())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), ClientError> {
        self.call(Request::Subscribe(topic.to_string()))
            .await
            .map(|_| ())
    }

    async fn poll_once(&mut self) -> Result<Option<InboundMessage>, ClientError> {
        self.call(Request::Poll).await
    }

    async fn ping(&mut self) -> Result<(), ClientError> {
        self.call(Request::Ping).await.map(|_| ())
    }
}
