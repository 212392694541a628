//! Publish/subscribe client capability
//!
//! The wire protocol lives in the board's client library. The core only
//! needs connect, publish, subscribe, a non-blocking poll and keepalive.

use heapless::{String, Vec};

use crate::config::MAX_RENDERED_TOPIC_LEN;

/// Maximum inbound payload kept by [`PubSubClient::poll_once`]
pub const MAX_INBOUND_PAYLOAD: usize = 128;

/// Delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Message the broker publishes when the session dies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

/// Session parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub keepalive_s: u16,
    pub will: Option<LastWill<'a>>,
    /// Upper bound for socket connect plus CONNACK
    pub timeout_ms: u32,
}

/// Message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InboundMessage {
    pub topic: String<MAX_RENDERED_TOPIC_LEN>,
    pub payload: Vec<u8, MAX_INBOUND_PAYLOAD>,
    /// Delivered from the broker's retained store
    pub retained: bool,
}

/// Client failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientError {
    /// Socket or name resolution failure
    Transport,
    /// No answer within the deadline
    Timeout,
    /// Broker rejected the request
    Refused,
    /// Malformed or unexpected packet
    Protocol,
    /// No session
    NotConnected,
}

/// Pub/sub session
#[allow(async_fn_in_trait)]
pub trait PubSubClient {
    /// Open the transport and establish a session
    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), ClientError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ClientError>;

    /// Return the next inbound message, or `None` if nothing is pending
    async fn poll_once(&mut self) -> Result<Option<InboundMessage>, ClientError>;

    /// Keepalive
    async fn ping(&mut self) -> Result<(), ClientError>;
}
