//! Bridge configuration
//!
//! A TOML file (optional) layered over built-in defaults, then overridden by
//! `CAN2MQTT__SECTION__KEY` environment variables. `${VAR}` and
//! `${VAR:-fallback}` references inside the file are expanded before parsing.

use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use can::{CanConfig, CanDriver};
pub use mqtt::MqttConfig;

mod can;
mod mqtt;

/// Expand `${VAR}` and `${VAR:-fallback}` references; unset without a
/// fallback expands to nothing.
fn substitute_env_vars(content: &str) -> String {
    let pattern = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(pattern) => pattern,
        Err(_) => return content.to_owned(),
    };
    let expanded = pattern.replace_all(content, |caps: &regex::Captures| {
        match std::env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => caps.get(2).map_or_else(String::new, |m| m.as_str().to_owned()),
        }
    });
    expanded.into_owned()
}


#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    /// Malformed TOML
    Parse(toml::de::Error),
    /// Layering or deserialization failure
    Config(config::ConfigError),
    /// Values that parse but cannot be used
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid TOML: {}", e),
            ConfigError::Config(e) => write!(f, "{}", e),
            ConfigError::Validation(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Everything the `can2mqtt` binary reads at startup
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub can: CanConfig,
    pub mqtt: MqttConfig,
    pub tables: TablesConfig,
    pub queues: QueuesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Mapping table paths
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TablesConfig {
    /// CAN frames to publish
    #[serde(default = "default_publish_table")]
    pub publish: PathBuf,
    /// Topics to subscribe and transmit
    #[serde(default = "default_subscribe_table")]
    pub subscribe: PathBuf,
}

fn default_publish_table() -> PathBuf {
    PathBuf::from("can2mqtt.csv")
}

fn default_subscribe_table() -> PathBuf {
    PathBuf::from("mqtt2can.csv")
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            publish: default_publish_table(),
            subscribe: default_subscribe_table(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// Slots in each of the three worker queues
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    10
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

impl Config {
    /// Build the configuration from `path` (skipped when missing), the
    /// defaults below and `CAN2MQTT__` environment overrides, e.g.
    /// `CAN2MQTT__CAN__INTERFACE=vcan0` or `CAN2MQTT__QUEUES__CAPACITY=32`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let defaults: [(&str, config::Value); 14] = [
            ("log.level", "info".into()),
            ("can.driver", "socketcan".into()),
            ("can.interface", "can0".into()),
            ("can.poll_timeout", "100ms".into()),
            ("can.transmit_timeout", "0s".into()),
            ("can.print_frames", false.into()),
            ("mqtt.address", "localhost:1883".into()),
            ("mqtt.keepalive", "60s".into()),
            ("mqtt.connect_timeout", "10s".into()),
            ("mqtt.reconnect_interval", "1s".into()),
            ("mqtt.max_reconnect_interval", "60s".into()),
            ("tables.publish", "can2mqtt.csv".into()),
            ("tables.subscribe", "mqtt2can.csv".into()),
            ("queues.capacity", 10i64.into()),
        ];
        let mut builder = config::Config::builder();
        for (key, value) in defaults {
            builder = builder.set_default(key, value)?;
        }

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let content = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&content, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // `__` nests; single underscores stay part of the key
        let env = Environment::with_prefix("CAN2MQTT")
            .separator("__")
            .try_parsing(true);
        let config: Config = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse a TOML document as-is; no environment handling
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.queues.capacity == 0, "queues.capacity must be at least 1"),
            (
                self.can.driver == CanDriver::Socketcan && self.can.interface.trim().is_empty(),
                "can.interface is required for the socketcan driver",
            ),
            (self.can.poll_timeout.is_zero(), "can.poll_timeout must be non-zero"),
            (self.mqtt.address.trim().is_empty(), "mqtt.address is required"),
            (
                self.mqtt.reconnect_interval.is_zero(),
                "mqtt.reconnect_interval must be non-zero",
            ),
            (
                self.mqtt.max_reconnect_interval < self.mqtt.reconnect_interval,
                "mqtt.max_reconnect_interval is below mqtt.reconnect_interval",
            ),
            (
                self.mqtt.password.is_some() && self.mqtt.username.is_none(),
                "mqtt.password requires mqtt.username",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ConfigError::Validation(reason.to_string())),
            None => Ok(()),
        }
    }
}
