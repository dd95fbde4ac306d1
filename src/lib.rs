//! can2mqtt - CAN bus to MQTT bridge
//!
//! Forwards frames from a CAN interface to an MQTT broker and broker
//! messages back onto the bus, routed by two line-oriented mapping tables.

pub mod bridge;
pub mod can;
pub mod client;
pub mod codec;
pub mod config;
pub mod mapping;
pub mod protocol;

pub use bridge::{Bridge, BridgeSettings, BridgeTasks};
pub use can::{CanBus, CanFrame, FrameKind};
pub use client::{BrokerClient, MqttClient};
pub use config::Config;
pub use mapping::{RoutingRule, RoutingTable};
pub use protocol::QoS;
