//! Publish worker: drains the publish queue into the broker

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::client::{BrokerClient, ClientError};
use crate::protocol::QoS;

use super::message::BridgeMessage;

/// Service level for everything the bridge publishes
pub const PUBLISH_QOS: QoS = QoS::AtLeastOnce;

pub struct Publisher {
    client: Arc<dyn BrokerClient>,
    rx: mpsc::Receiver<BridgeMessage>,
}

impl Publisher {
    pub fn new(client: Arc<dyn BrokerClient>, rx: mpsc::Receiver<BridgeMessage>) -> Self {
        Self { client, rx }
    }

    /// Wait for the first connection, then publish until the queue closes
    /// or the client shuts down.
    ///
    /// Messages that arrive while the broker is unreachable are dropped.
    pub async fn run(mut self) {
        if let Err(e) = self.client.wait_connected().await {
            error!("Publisher [{}]: {}", self.client.name(), e);
            return;
        }
        info!("Publisher [{}]: connected", self.client.name());

        while let Some(message) = self.rx.recv().await {
            let payload = Bytes::copy_from_slice(message.payload());
            match self
                .client
                .publish(message.topic(), payload, PUBLISH_QOS, false)
                .await
            {
                Ok(()) => debug!(
                    "Published {} ({} bytes)",
                    message.topic(),
                    message.payload().len()
                ),
                Err(ClientError::Closed) => {
                    error!("Publisher [{}]: client closed", self.client.name());
                    return;
                }
                Err(e) => error!("Failed to publish {}: {}", message.topic(), e),
            }
        }

        debug!("Publisher [{}]: queue closed", self.client.name());
    }
}
