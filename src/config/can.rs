//! CAN interface configuration.

use std::time::Duration;

use serde::Deserialize;

/// Bus driver selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanDriver {
    /// Linux SocketCAN interface
    #[default]
    Socketcan,
    /// In-process bus with nothing attached (dry runs)
    Virtual,
}

impl std::fmt::Display for CanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanDriver::Socketcan => write!(f, "socketcan"),
            CanDriver::Virtual => write!(f, "virtual"),
        }
    }
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(100)
}

/// CAN interface configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Driver backing the bus
    pub driver: CanDriver,

    /// Interface name (e.g. "can0", "vcan0")
    #[serde(default = "default_interface")]
    pub interface: String,

    /// How long one receive waits before the worker drains the transmit queue
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Transmit wait; zero means non-blocking
    #[serde(with = "humantime_serde")]
    pub transmit_timeout: Duration,

    /// Log every received frame
    pub print_frames: bool,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            driver: CanDriver::default(),
            interface: default_interface(),
            poll_timeout: default_poll_timeout(),
            transmit_timeout: Duration::ZERO,
            print_frames: false,
        }
    }
}
