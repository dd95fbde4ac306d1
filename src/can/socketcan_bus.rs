//! Linux SocketCAN driver
//!
//! Wraps a raw `socketcan::CanSocket`. Error frames are enabled on the
//! socket so the driver can track the controller state; they are reported
//! to the caller as receive errors and never forwarded as data.
//!
//! State transitions:
//! - bus-off error frame: `BusOff`
//! - restarted or back to error-active: `Running`
//! - interface down (`ENETDOWN`): `Stopped`, until a read succeeds or
//!   times out normally again
//! - any received data or remote frame: `Running`

use std::io;
use std::time::{Duration, Instant};

use socketcan::errors::ControllerProblem;
use socketcan::{
    CanDataFrame, CanError, CanFrame as RawFrame, CanRemoteFrame, CanSocket, EmbeddedFrame,
    ExtendedId, Id, Socket, SocketOptions, StandardId,
};
use tracing::{debug, info, warn};

use super::{BusError, BusState, CanBus, CanFrame, FrameKind};

/// CAN controller backed by a SocketCAN interface (e.g. `can0`, `vcan0`)
pub struct SocketCanBus {
    socket: CanSocket,
    interface: String,
    state: BusState,
}

impl SocketCanBus {
    /// Open a SocketCAN interface by name
    pub fn open(interface: &str) -> Result<Self, BusError> {
        let socket = CanSocket::open(interface)?;
        socket.set_error_filter_accept_all()?;

        debug!("CAN interface '{}' opened", interface);

        Ok(Self {
            socket,
            interface: interface.to_string(),
            state: BusState::Running,
        })
    }

    fn write_nonblocking(&self, frame: &RawFrame) -> io::Result<()> {
        self.socket.set_nonblocking(true)?;
        let result = self.socket.write_frame(frame);
        self.socket.set_nonblocking(false)?;
        result
    }
}

/// Controller state after an error frame
fn state_after_error(current: BusState, error: &CanError) -> BusState {
    match error {
        CanError::BusOff => BusState::BusOff,
        CanError::Restarted | CanError::ControllerProblem(ControllerProblem::Active) => {
            BusState::Running
        }
        _ => current,
    }
}

/// Controller state after a failed read
fn state_after_read_error(current: BusState, error: &io::Error) -> BusState {
    if is_timeout(error) {
        // Reads work again; the interface is back up
        if current == BusState::Stopped {
            return BusState::Running;
        }
        return current;
    }
    if error.kind() == io::ErrorKind::NetworkDown {
        return BusState::Stopped;
    }
    current
}

/// Failing reads return at once; sleep out the rest of the poll window so
/// a caller retrying in a loop keeps its cadence
fn hold_poll_window(started: Instant, timeout: Duration) {
    std::thread::sleep(timeout.saturating_sub(started.elapsed()));
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn from_raw(frame: &RawFrame) -> Result<CanFrame, BusError> {
    let (kind, id) = match frame.id() {
        Id::Standard(id) => (FrameKind::Standard, id.as_raw() as u32),
        Id::Extended(id) => (FrameKind::Extended, id.as_raw()),
    };
    CanFrame::from_raw(
        kind,
        id,
        frame.is_remote_frame(),
        frame.dlc() as u8,
        frame.data(),
    )
}

fn to_raw(frame: &CanFrame) -> Result<RawFrame, BusError> {
    let id: Id = match frame.kind() {
        FrameKind::Standard => u16::try_from(frame.id())
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard),
        FrameKind::Extended => ExtendedId::new(frame.id()).map(Id::Extended),
    }
    .ok_or_else(|| BusError::InvalidFrame(format!("identifier 0x{:x}", frame.id())))?;

    let raw = if frame.is_remote() {
        CanRemoteFrame::new_remote(id, frame.dlc() as usize).map(RawFrame::Remote)
    } else {
        CanDataFrame::new(id, frame.data()).map(RawFrame::Data)
    };

    raw.ok_or_else(|| BusError::InvalidFrame("frame rejected by socketcan".to_string()))
}

impl CanBus for SocketCanBus {
    fn receive(&mut self, timeout: Duration) -> Result<CanFrame, BusError> {
        let started = Instant::now();
        let (next, result) = match self.socket.read_frame_timeout(timeout) {
            Ok(RawFrame::Error(frame)) => {
                let error = frame.into_error();
                let next = state_after_error(self.state, &error);
                (next, Err(BusError::ErrorFrame(format!("{:?}", error))))
            }
            Ok(frame) => (BusState::Running, from_raw(&frame)),
            Err(e) => {
                let next = state_after_read_error(self.state, &e);
                if is_timeout(&e) {
                    (next, Err(BusError::Timeout))
                } else {
                    hold_poll_window(started, timeout);
                    (next, Err(BusError::Io(e)))
                }
            }
        };

        if next != self.state {
            if next == BusState::Running {
                info!("CAN interface '{}' is {}", self.interface, next);
            } else {
                warn!("CAN interface '{}' is {}", self.interface, next);
            }
            self.state = next;
        }
        result
    }

    fn transmit(&mut self, frame: &CanFrame, timeout: Duration) -> Result<(), BusError> {
        let raw = to_raw(frame)?;

        let result = if timeout.is_zero() {
            self.write_nonblocking(&raw)
        } else {
            self.socket
                .set_write_timeout(timeout)
                .and_then(|_| self.socket.write_frame(&raw))
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_timeout(&e) => Err(BusError::Timeout),
            Err(e) => Err(BusError::Io(e)),
        }
    }

    fn status(&self) -> BusState {
        self.state
    }
}
