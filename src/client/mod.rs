//! Broker Client
//!
//! The bridge talks to the broker through the [`BrokerClient`] trait so the
//! workers can be driven by a scripted client in tests. [`MqttClient`] is
//! the production implementation: an MQTT v3.1.1 client over TCP whose
//! connection lives in a background task.

mod mqtt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::QoS;

pub use mqtt::MqttClient;

/// Default MQTT port when the address does not carry one
pub const DEFAULT_PORT: u16 = 1883;

/// Callback for messages delivered by the broker: `(topic, payload)`
///
/// Runs on the client's connection task, so it must not block.
pub type InboundCallback = Arc<dyn Fn(String, Bytes) + Send + Sync>;

/// Error type for broker client operations
#[derive(Debug)]
pub enum ClientError {
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Operation attempted while the client is not connected
    NotConnected,
    /// Broker refused the connection
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Broker sent something that could not be decoded or was unexpected
    Protocol(String),
    /// Client has shut down
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            ClientError::NotConnected => write!(f, "Broker not connected"),
            ClientError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            ClientError::Timeout => write!(f, "Operation timed out"),
            ClientError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ClientError::Closed => write!(f, "Client closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::ConnectionLost(e.to_string())
    }
}

/// Status of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Not connected, will attempt to connect
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
    /// Shut down, will not reconnect
    Closed,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Connecting => "connecting",
            ClientStatus::Connected => "connected",
            ClientStatus::Backoff => "backoff",
            ClientStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Connection parameters for one client instance
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// MQTT client identifier
    pub client_id: String,
    /// Broker address: `host`, `host:port` or `mqtt://host:port`
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive interval; zero disables PINGREQ
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    /// First reconnect delay, doubled on every failure
    pub reconnect_interval: Duration,
    /// Upper bound for the reconnect delay
    pub max_reconnect_interval: Duration,
}

impl ClientOptions {
    pub fn new(client_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            address: address.into(),
            username: None,
            password: None,
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
        }
    }

    /// Split the address into host and port
    pub fn host_port(&self) -> (String, u16) {
        let address = self
            .address
            .strip_prefix("mqtt://")
            .or_else(|| self.address.strip_prefix("tcp://"))
            .unwrap_or(&self.address)
            .trim_end_matches('/');

        if let Some((host, port_str)) = address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (address.to_string(), DEFAULT_PORT)
    }
}

/// Operations the bridge needs from a broker connection
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Client identifier, for logging
    fn name(&self) -> &str;

    /// Current connection status
    fn status(&self) -> ClientStatus;

    fn is_connected(&self) -> bool {
        self.status() == ClientStatus::Connected
    }

    /// Wait until the client reports `Connected`.
    ///
    /// Returns immediately if already connected; fails only once the client
    /// has shut down.
    async fn wait_connected(&self) -> Result<(), ClientError>;

    /// Publish a message.
    ///
    /// Fails with [`ClientError::NotConnected`] when the broker connection
    /// is down; the message is not queued for later.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port() {
        let cases = [
            ("localhost", ("localhost", 1883)),
            ("localhost:1884", ("localhost", 1884)),
            ("mqtt://broker.local:1883", ("broker.local", 1883)),
            ("mqtt://broker.local/", ("broker.local", 1883)),
            ("tcp://10.0.0.2:8000", ("10.0.0.2", 8000)),
        ];

        for (address, (host, port)) in cases {
            let options = ClientOptions::new("c", address);
            assert_eq!(options.host_port(), (host.to_string(), port), "{}", address);
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ClientError::NotConnected.to_string(), "Broker not connected");
        assert_eq!(
            ClientError::Rejected("not authorized".into()).to_string(),
            "Rejected: not authorized"
        );
    }
}
