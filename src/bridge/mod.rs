//! CAN <-> MQTT Bridge
//!
//! Composition root for the three workers and the queues between them:
//!
//! ```text
//!            publish queue              broker
//!  bus  --> CanWorker ------> Publisher -------> pub-<suffix>
//!   ^
//!   |        transmit queue          inbound queue
//!   +------ CanWorker <------ Subscriber <------- sub-<suffix>
//! ```
//!
//! The bus worker owns the driver and runs on a blocking thread; it polls
//! for frames and sends queued transmit requests whenever a poll times out.
//! Both tables are read-only after startup and shared as `Arc`s.
//!
//! Broker deliveries reach the subscriber through a callback that must not
//! block, so the inbound queue is lossy: when it is full, deliveries are
//! dropped and logged.

mod can_worker;
mod message;
mod publisher;
mod subscriber;
mod translate;


use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::can::CanBus;
use crate::client::{BrokerClient, InboundCallback};
use crate::config::Config;
use crate::mapping::RoutingTable;

pub use can_worker::{CanWorker, PollOutcome};
pub use message::{BoundsError, BridgeFrame, BridgeMessage, InboundMessage, MAX_PAYLOAD_LEN};
pub use publisher::{Publisher, PUBLISH_QOS};
pub use subscriber::{Subscriber, SUBSCRIBE_QOS};
pub use translate::{frame_to_messages, message_to_frames, Truncation};

/// Error creating the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Queues need room for at least one item
    ZeroCapacity,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::ZeroCapacity => write!(f, "queue capacity must be at least 1"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Runtime parameters of the bridge
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Capacity of each queue
    pub capacity: usize,
    /// How long one bus receive may wait
    pub poll_timeout: Duration,
    /// How long one bus transmit may wait for room
    pub transmit_timeout: Duration,
    /// Log every received frame
    pub print_frames: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            capacity: 10,
            poll_timeout: Duration::from_millis(100),
            transmit_timeout: Duration::ZERO,
            print_frames: false,
        }
    }
}

impl From<&Config> for BridgeSettings {
    fn from(config: &Config) -> Self {
        Self {
            capacity: config.queues.capacity,
            poll_timeout: config.can.poll_timeout,
            transmit_timeout: config.can.transmit_timeout,
            print_frames: config.can.print_frames,
        }
    }
}

/// Owns the tables and queues until the workers are spawned
pub struct Bridge {
    settings: BridgeSettings,
    publish_table: Arc<RoutingTable>,
    subscribe_table: Arc<RoutingTable>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
}

impl Bridge {
    pub fn new(
        settings: BridgeSettings,
        publish_table: RoutingTable,
        subscribe_table: RoutingTable,
    ) -> Result<Self, BridgeError> {
        if settings.capacity == 0 {
            return Err(BridgeError::ZeroCapacity);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(settings.capacity);

        Ok(Self {
            settings,
            publish_table: Arc::new(publish_table),
            subscribe_table: Arc::new(subscribe_table),
            inbound_tx,
            inbound_rx,
        })
    }

    pub fn publish_table(&self) -> &Arc<RoutingTable> {
        &self.publish_table
    }

    pub fn subscribe_table(&self) -> &Arc<RoutingTable> {
        &self.subscribe_table
    }

    /// Callback to install on the subscribing client.
    ///
    /// Never blocks: a delivery is dropped when the inbound queue is full
    /// or its topic cannot match any rule. Payloads over 64 bytes are cut.
    pub fn inbound_callback(&self) -> InboundCallback {
        let tx = self.inbound_tx.clone();

        Arc::new(move |topic: String, payload: bytes::Bytes| {
            let payload = if payload.len() > MAX_PAYLOAD_LEN {
                warn!(
                    "Delivery on {} cut from {} to {} bytes",
                    topic,
                    payload.len(),
                    MAX_PAYLOAD_LEN
                );
                payload.slice(..MAX_PAYLOAD_LEN)
            } else {
                payload
            };

            let message = match InboundMessage::new(&topic, &payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping delivery on {}: {}", topic, e);
                    return;
                }
            };

            match tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Inbound queue full, dropping delivery on {}", topic)
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Inbound queue closed, dropping delivery on {}", topic)
                }
            }
        })
    }

    /// Start the bus worker and both broker workers.
    ///
    /// The subscribing client must already carry [`Bridge::inbound_callback`].
    pub fn spawn<B>(
        self,
        bus: B,
        pub_client: Arc<dyn BrokerClient>,
        sub_client: Arc<dyn BrokerClient>,
    ) -> BridgeTasks
    where
        B: CanBus + 'static,
    {
        let Bridge {
            settings,
            publish_table,
            subscribe_table,
            inbound_tx,
            inbound_rx,
        } = self;

        // Only the installed callback keeps the inbound queue open
        drop(inbound_tx);

        let (broker_tx, broker_rx) = mpsc::channel(settings.capacity);
        let (bus_tx, bus_rx) = mpsc::channel(settings.capacity);

        info!(
            "Starting bridge: {} publish rules, {} subscribe rules, queue capacity {}",
            publish_table.len(),
            subscribe_table.len(),
            settings.capacity
        );

        let worker = CanWorker::new(bus, publish_table, broker_tx, bus_rx, settings.poll_timeout)
            .with_transmit_timeout(settings.transmit_timeout)
            .with_print_frames(settings.print_frames);

        // The subscriber holds the only transmit sender; when it stops, the
        // bus worker sees the queue close and stops too.
        let subscriber = Subscriber::new(sub_client, subscribe_table, inbound_rx, bus_tx);
        let publisher = Publisher::new(pub_client, broker_rx);

        BridgeTasks {
            can: tokio::task::spawn_blocking(move || worker.run()),
            publisher: tokio::spawn(publisher.run()),
            subscriber: tokio::spawn(subscriber.run()),
        }
    }
}

/// Handles of the running workers
pub struct BridgeTasks {
    pub can: JoinHandle<()>,
    pub publisher: JoinHandle<()>,
    pub subscriber: JoinHandle<()>,
}

impl BridgeTasks {
    /// Wait for all workers to stop
    pub async fn join(self) {
        for (name, handle) in [
            ("can", self.can),
            ("publisher", self.publisher),
            ("subscriber", self.subscriber),
        ] {
            if let Err(e) = handle.await {
                error!("Bridge worker {} failed: {}", name, e);
            }
        }
    }
}
