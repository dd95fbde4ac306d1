//! Bus worker
//!
//! The only code that touches the CAN driver. Each iteration waits one poll
//! interval for a frame; receiving and transmitting share the thread, so an
//! idle poll is the moment a queued transmit request goes out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info};

use crate::can::{BusError, BusState, CanBus};
use crate::mapping::RoutingTable;

use super::message::{BridgeFrame, BridgeMessage};
use super::translate::frame_to_messages;

/// Result of one [`CanWorker::poll_once`] iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A frame arrived; `matched` messages were queued for publishing
    Received { matched: usize },
    /// A queued frame was handed to the driver
    Transmitted,
    /// The driver refused a queued frame; it is dropped
    TransmitFailed,
    /// A queued frame was dropped because the controller is not running
    NotRunning(BusState),
    /// Nothing received and nothing to send
    Idle,
    /// The driver reported a receive error other than a timeout
    ReceiveFailed,
    /// The bus or one of the queues is gone; the worker must stop
    Closed,
}

/// Drives one CAN interface
pub struct CanWorker<B: CanBus> {
    bus: B,
    table: Arc<RoutingTable>,
    broker_tx: mpsc::Sender<BridgeMessage>,
    bus_rx: mpsc::Receiver<BridgeFrame>,
    poll_timeout: Duration,
    transmit_timeout: Duration,
    print_frames: bool,
}

impl<B: CanBus> CanWorker<B> {
    pub fn new(
        bus: B,
        table: Arc<RoutingTable>,
        broker_tx: mpsc::Sender<BridgeMessage>,
        bus_rx: mpsc::Receiver<BridgeFrame>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            table,
            broker_tx,
            bus_rx,
            poll_timeout,
            transmit_timeout: Duration::ZERO,
            print_frames: false,
        }
    }

    /// How long the driver may wait for room when transmitting
    pub fn with_transmit_timeout(mut self, timeout: Duration) -> Self {
        self.transmit_timeout = timeout;
        self
    }

    /// Log every received frame at info level
    pub fn with_print_frames(mut self, print_frames: bool) -> Self {
        self.print_frames = print_frames;
        self
    }

    /// Run until the bus disconnects or a queue closes.
    ///
    /// Blocks the calling thread; spawn it with `spawn_blocking`.
    pub fn run(mut self) {
        info!(
            "CAN worker started ({} rules, poll {:?})",
            self.table.len(),
            self.poll_timeout
        );

        while self.poll_once() != PollOutcome::Closed {}

        info!("CAN worker stopped");
    }

    /// One receive attempt, followed by at most one transmit when idle
    pub fn poll_once(&mut self) -> PollOutcome {
        match self.bus.receive(self.poll_timeout) {
            Ok(frame) => {
                if self.print_frames {
                    info!("{}", frame);
                }

                let messages = frame_to_messages(&self.table, &frame);
                let matched = messages.len();
                for message in messages {
                    debug!("Queueing {} for publish", message.topic());
                    // Waits for room: frames are not lost to a slow broker
                    if self.broker_tx.blocking_send(message).is_err() {
                        debug!("Publish queue closed");
                        return PollOutcome::Closed;
                    }
                }
                PollOutcome::Received { matched }
            }
            Err(BusError::Timeout) => self.transmit_pending(),
            Err(BusError::Disconnected) => {
                error!("CAN bus disconnected");
                PollOutcome::Closed
            }
            Err(e) => {
                error!("CAN receive failed: {}", e);
                PollOutcome::ReceiveFailed
            }
        }
    }

    fn transmit_pending(&mut self) -> PollOutcome {
        let request = match self.bus_rx.try_recv() {
            Ok(request) => request,
            Err(TryRecvError::Empty) => return PollOutcome::Idle,
            Err(TryRecvError::Disconnected) => {
                debug!("Transmit queue closed");
                return PollOutcome::Closed;
            }
        };

        let state = self.bus.status();
        if state != BusState::Running {
            error!(
                "CAN controller not running ({}), dropping frame for 0x{:x}",
                state,
                request.id()
            );
            return PollOutcome::NotRunning(state);
        }

        let frame = match request.to_can_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Cannot build frame for 0x{:x}: {}", request.id(), e);
                return PollOutcome::TransmitFailed;
            }
        };

        match self.bus.transmit(&frame, self.transmit_timeout) {
            Ok(()) => {
                info!("Message queued for transmission: {}", frame);
                PollOutcome::Transmitted
            }
            Err(BusError::Disconnected) => {
                error!("CAN bus disconnected");
                PollOutcome::Closed
            }
            Err(e) => {
                error!("Failed to queue message for transmission: {}", e);
                PollOutcome::TransmitFailed
            }
        }
    }
}
