//! Broker connection configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::client::ClientOptions;

fn default_address() -> String {
    "localhost:1883".to_string()
}

fn default_keepalive() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(60)
}

/// Broker connection configuration, shared by the publishing and the
/// subscribing client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address (host, host:port or mqtt://host:port)
    #[serde(default = "default_address")]
    pub address: String,

    /// Suffix for the `pub-`/`sub-` client ids; defaults to the host name
    pub client_id_suffix: Option<String>,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Keep-alive interval (e.g. "60s"); "0s" disables it
    #[serde(default = "default_keepalive", with = "humantime_serde")]
    pub keepalive: Duration,

    /// TCP connect and CONNACK timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// First reconnect delay
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Maximum reconnect delay (for exponential backoff)
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            client_id_suffix: None,
            username: None,
            password: None,
            keepalive: default_keepalive(),
            connect_timeout: default_connect_timeout(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
        }
    }
}

impl MqttConfig {
    /// Get the client id suffix, falling back to the host name
    pub fn get_client_id_suffix(&self) -> String {
        self.client_id_suffix.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| std::process::id().to_string())
        })
    }

    /// Connection options for one client, identified as `<role>-<suffix>`
    pub fn client_options(&self, role: &str) -> ClientOptions {
        ClientOptions {
            client_id: format!("{}-{}", role, self.get_client_id_suffix()),
            address: self.address.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            keepalive: self.keepalive,
            connect_timeout: self.connect_timeout,
            reconnect_interval: self.reconnect_interval,
            max_reconnect_interval: self.max_reconnect_interval,
        }
    }
}
