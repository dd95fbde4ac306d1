//! In-process CAN bus
//!
//! A [`VirtualBus`] behaves like a controller attached to a bus whose other
//! nodes are driven through a [`VirtualBusHandle`]: frames injected on the
//! handle are received by the bus, and frames the bus transmits show up on
//! the handle. Used for tests and dry runs without hardware.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::debug;

use super::{BusError, BusState, CanBus, CanFrame};

/// Controller end of the virtual bus
pub struct VirtualBus {
    rx: Receiver<CanFrame>,
    tx: Sender<CanFrame>,
    state: Arc<Mutex<BusState>>,
}

/// Remote end of the virtual bus
#[derive(Clone)]
pub struct VirtualBusHandle {
    inject: Sender<CanFrame>,
    transmitted: Receiver<CanFrame>,
    state: Arc<Mutex<BusState>>,
}

impl VirtualBus {
    /// Create a running bus and the handle that drives its remote end
    pub fn new() -> (Self, VirtualBusHandle) {
        let (inject, rx) = unbounded();
        let (tx, transmitted) = unbounded();
        let state = Arc::new(Mutex::new(BusState::Running));

        let bus = Self {
            rx,
            tx,
            state: state.clone(),
        };
        let handle = VirtualBusHandle {
            inject,
            transmitted,
            state,
        };
        (bus, handle)
    }
}

impl CanBus for VirtualBus {
    fn receive(&mut self, timeout: Duration) -> Result<CanFrame, BusError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(BusError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                // Behave like an idle controller so callers don't spin
                std::thread::sleep(timeout);
                Err(BusError::Disconnected)
            }
        }
    }

    fn transmit(&mut self, frame: &CanFrame, _timeout: Duration) -> Result<(), BusError> {
        let state = *self.state.lock();
        if state != BusState::Running {
            return Err(BusError::NotRunning(state));
        }
        self.tx.send(*frame).map_err(|_| BusError::Disconnected)
    }

    fn status(&self) -> BusState {
        *self.state.lock()
    }
}

impl VirtualBusHandle {
    /// Put a frame on the bus for the controller to receive
    pub fn inject(&self, frame: CanFrame) -> Result<(), BusError> {
        self.inject.send(frame).map_err(|_| BusError::Disconnected)
    }

    /// Next frame the controller transmitted, waiting up to `timeout`
    pub fn next_transmitted(&self, timeout: Duration) -> Option<CanFrame> {
        self.transmitted.recv_timeout(timeout).ok()
    }

    /// Next frame the controller transmitted, if any
    pub fn try_transmitted(&self) -> Option<CanFrame> {
        self.transmitted.try_recv().ok()
    }

    /// Log and discard everything the controller transmits until the bus
    /// is dropped, returning how many frames went by. Blocks the caller.
    pub fn discard_transmitted(self) -> usize {
        let mut count = 0;
        while let Ok(frame) = self.transmitted.recv() {
            debug!("Virtual bus transmitted {}", frame);
            count += 1;
        }
        count
    }

    /// Force the state the controller reports
    pub fn set_state(&self, state: BusState) {
        *self.state.lock() = state;
    }
}
