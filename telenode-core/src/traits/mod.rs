//! Capability traits
//!
//! These traits define the interface between the telemetry logic and the
//! board: radio, pub/sub client, sensors, watchdog, clock and restart.

pub mod pubsub;
pub mod radio;
pub mod sensor;
pub mod system;

pub use pubsub::{ClientError, ConnectOptions, InboundMessage, LastWill, PubSubClient, QoS};
pub use radio::{IpConfig, Radio, RadioError, ScanEntry, ScanList};
pub use sensor::{ElectricalSensor, EnvironmentalSensor, NoEnvironmentalSensor, SensorError};
pub use system::{delay_fed, Clock, NoWatchdog, Platform, Restart, Watchdog};
