//! Subscribe worker
//!
//! Registers one subscription per broker -> bus rule, then turns every
//! delivery into transmit requests for the bus worker.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::client::BrokerClient;
use crate::mapping::RoutingTable;
use crate::protocol::QoS;

use super::message::{BridgeFrame, InboundMessage};
use super::translate::message_to_frames;

/// Service level requested for every subscription
pub const SUBSCRIBE_QOS: QoS = QoS::AtMostOnce;

pub struct Subscriber {
    client: Arc<dyn BrokerClient>,
    table: Arc<RoutingTable>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    bus_tx: mpsc::Sender<BridgeFrame>,
}

impl Subscriber {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        table: Arc<RoutingTable>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        bus_tx: mpsc::Sender<BridgeFrame>,
    ) -> Self {
        Self {
            client,
            table,
            inbound_rx,
            bus_tx,
        }
    }

    /// Subscribe once the first connection is up, then forward deliveries
    /// until the inbound queue or the transmit queue closes.
    ///
    /// Subscriptions are registered once; they are not renewed after a
    /// reconnect.
    pub async fn run(mut self) {
        if let Err(e) = self.client.wait_connected().await {
            error!("Subscriber [{}]: {}", self.client.name(), e);
            return;
        }
        info!("Subscriber [{}]: connected", self.client.name());

        for (index, rule) in self.table.iter().enumerate() {
            info!("subscribe[{}] topic=[{}]", index, rule.topic());
            if let Err(e) = self.client.subscribe(rule.topic(), SUBSCRIBE_QOS).await {
                error!("Failed to subscribe to {}: {}", rule.topic(), e);
            }
        }

        while let Some(message) = self.inbound_rx.recv().await {
            let (frames, _) = message_to_frames(&self.table, &message);
            if frames.is_empty() {
                debug!("No rule for {}", message.topic());
                continue;
            }

            for frame in frames {
                debug!("Queueing 0x{:x} for transmit", frame.id());
                // Waits for room: the bus worker drains one request per idle poll
                if self.bus_tx.send(frame).await.is_err() {
                    debug!("Transmit queue closed");
                    return;
                }
            }
        }

        debug!("Subscriber [{}]: inbound queue closed", self.client.name());
    }
}
