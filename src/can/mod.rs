//! CAN Bus Abstraction
//!
//! Frame type and driver trait for the field bus side of the bridge.
//! The bridge only ever talks to the bus through [`CanBus`], so the
//! SocketCAN driver and the in-process virtual bus are interchangeable.
//!
//! The driver contract mirrors a classic CAN controller:
//! - `receive` waits at most `timeout` for one frame
//! - `transmit` queues one frame, waiting at most `timeout` for room
//! - `status` reports whether the controller is currently running

mod virtual_bus;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
mod socketcan_bus;

use std::fmt;
use std::time::Duration;

pub use virtual_bus::{VirtualBus, VirtualBusHandle};

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub use socketcan_bus::SocketCanBus;

/// Maximum number of data bytes in a classic CAN frame
pub const MAX_DATA_LEN: usize = 8;

/// Highest valid 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest valid 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Bus addressing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// 11-bit identifier
    Standard,
    /// 29-bit identifier
    Extended,
}

impl FrameKind {
    /// Parse the single-letter code used in mapping tables (`S` or `E`)
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "S" => Some(FrameKind::Standard),
            "E" => Some(FrameKind::Extended),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FrameKind::Standard => "S",
            FrameKind::Extended => "E",
        }
    }

    /// Largest identifier representable in this addressing mode
    pub fn max_id(&self) -> u32 {
        match self {
            FrameKind::Standard => MAX_STANDARD_ID,
            FrameKind::Extended => MAX_EXTENDED_ID,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, FrameKind::Extended)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Standard => write!(f, "standard"),
            FrameKind::Extended => write!(f, "extended"),
        }
    }
}

/// A single frame as seen by the controller.
///
/// `dlc` is the raw data length code. Controllers may report codes above 8
/// for classic frames; only the first 8 bytes are ever carried, so
/// [`CanFrame::data`] caps the slice at [`MAX_DATA_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    kind: FrameKind,
    remote: bool,
    dlc: u8,
    data: [u8; MAX_DATA_LEN],
}

impl CanFrame {
    /// Build a data frame
    pub fn data_frame(kind: FrameKind, id: u32, data: &[u8]) -> Result<Self, BusError> {
        check_id(kind, id)?;
        if data.len() > MAX_DATA_LEN {
            return Err(BusError::InvalidFrame(format!(
                "{} data bytes exceed the {} byte limit",
                data.len(),
                MAX_DATA_LEN
            )));
        }

        let mut buf = [0u8; MAX_DATA_LEN];
        buf[..data.len()].copy_from_slice(data);

        Ok(Self {
            id,
            kind,
            remote: false,
            dlc: data.len() as u8,
            data: buf,
        })
    }

    /// Build a remote request frame asking for `dlc` bytes
    pub fn remote_frame(kind: FrameKind, id: u32, dlc: u8) -> Result<Self, BusError> {
        check_id(kind, id)?;
        if dlc as usize > MAX_DATA_LEN {
            return Err(BusError::InvalidFrame(format!("dlc {} exceeds 8", dlc)));
        }

        Ok(Self {
            id,
            kind,
            remote: true,
            dlc,
            data: [0u8; MAX_DATA_LEN],
        })
    }

    /// Build a frame exactly as a controller reported it.
    ///
    /// Drivers use this so that a remote request carrying stray data bytes,
    /// or a non-compliant dlc, reaches the bridge unchanged.
    pub fn from_raw(
        kind: FrameKind,
        id: u32,
        remote: bool,
        dlc: u8,
        data: &[u8],
    ) -> Result<Self, BusError> {
        check_id(kind, id)?;
        let mut buf = [0u8; MAX_DATA_LEN];
        let len = data.len().min(MAX_DATA_LEN);
        buf[..len].copy_from_slice(&data[..len]);

        Ok(Self {
            id,
            kind,
            remote,
            dlc,
            data: buf,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_extended(&self) -> bool {
        self.kind.is_extended()
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Raw data length code
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Data bytes, capped at 8 regardless of the reported dlc
    pub fn data(&self) -> &[u8] {
        let len = (self.dlc as usize).min(MAX_DATA_LEN);
        &self.data[..len]
    }
}

/// Formats a frame the way a bus monitor prints it:
/// `Standard ID: 0x1a2      DLC: 2  Data: 0x01 0x02`
impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FrameKind::Standard => write!(f, "Standard ID: 0x{:03x}     ", self.id)?,
            FrameKind::Extended => write!(f, "Extended ID: 0x{:08x}", self.id)?,
        }
        write!(f, " DLC: {}  Data:", self.dlc)?;

        if self.remote {
            write!(f, " REMOTE REQUEST FRAME")
        } else {
            for byte in self.data() {
                write!(f, " 0x{:02x}", byte)?;
            }
            Ok(())
        }
    }
}

fn check_id(kind: FrameKind, id: u32) -> Result<(), BusError> {
    if id > kind.max_id() {
        return Err(BusError::InvalidFrame(format!(
            "identifier 0x{:x} out of range for {} frame",
            id, kind
        )));
    }
    Ok(())
}

/// Controller state as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Transmitting and receiving normally
    Running,
    /// Interface is down
    Stopped,
    /// Too many errors, controller left the bus
    BusOff,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusState::Running => write!(f, "running"),
            BusState::Stopped => write!(f, "stopped"),
            BusState::BusOff => write!(f, "bus-off"),
        }
    }
}

/// Error type for bus driver operations
#[derive(Debug)]
pub enum BusError {
    /// Nothing arrived (or no room to send) within the timeout
    Timeout,
    /// The controller is not in the running state
    NotRunning(BusState),
    /// Underlying socket error
    Io(std::io::Error),
    /// The controller reported an error frame
    ErrorFrame(String),
    /// The other end of the bus went away
    Disconnected,
    /// Frame cannot be represented on the bus
    InvalidFrame(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Timeout => write!(f, "Operation timed out"),
            BusError::NotRunning(state) => write!(f, "Controller not running ({})", state),
            BusError::Io(e) => write!(f, "IO error: {}", e),
            BusError::ErrorFrame(msg) => write!(f, "Error frame: {}", msg),
            BusError::Disconnected => write!(f, "Bus disconnected"),
            BusError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
        }
    }
}

impl std::error::Error for BusError {}

impl From<std::io::Error> for BusError {
    fn from(e: std::io::Error) -> Self {
        BusError::Io(e)
    }
}

/// Bus driver used by the bridge.
///
/// Calls block the current thread for at most the given timeout, so
/// implementations are driven from a blocking worker thread, never from an
/// async task.
pub trait CanBus: Send {
    /// Wait up to `timeout` for one frame; `BusError::Timeout` if none arrived
    fn receive(&mut self, timeout: Duration) -> Result<CanFrame, BusError>;

    /// Queue one frame for transmission. A zero timeout never blocks.
    fn transmit(&mut self, frame: &CanFrame, timeout: Duration) -> Result<(), BusError>;

    /// Current controller state
    fn status(&self) -> BusState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_codes() {
        assert_eq!(FrameKind::from_code("S"), Some(FrameKind::Standard));
        assert_eq!(FrameKind::from_code("E"), Some(FrameKind::Extended));
        assert_eq!(FrameKind::from_code("s"), None);
        assert_eq!(FrameKind::from_code("X"), None);
        assert_eq!(FrameKind::from_code(""), None);
        assert_eq!(FrameKind::Extended.code(), "E");
    }

    #[test]
    fn test_data_frame() {
        let frame = CanFrame::data_frame(FrameKind::Standard, 0x1A2, &[0x01, 0x02]).unwrap();
        assert_eq!(frame.id(), 0x1A2);
        assert!(!frame.is_extended());
        assert!(!frame.is_remote());
        assert_eq!(frame.dlc(), 2);
        assert_eq!(frame.data(), &[0x01, 0x02]);
    }

    #[test]
    fn test_data_frame_rejects_nine_bytes() {
        let result = CanFrame::data_frame(FrameKind::Standard, 0x10, &[0u8; 9]);
        assert!(matches!(result, Err(BusError::InvalidFrame(_))));
    }

    #[test]
    fn test_identifier_ranges() {
        assert!(CanFrame::data_frame(FrameKind::Standard, 0x7FF, &[]).is_ok());
        assert!(CanFrame::data_frame(FrameKind::Standard, 0x800, &[]).is_err());
        assert!(CanFrame::data_frame(FrameKind::Extended, 0x800, &[]).is_ok());
        assert!(CanFrame::data_frame(FrameKind::Extended, 0x1FFF_FFFF, &[]).is_ok());
        assert!(CanFrame::data_frame(FrameKind::Extended, 0x2000_0000, &[]).is_err());
    }

    #[test]
    fn test_raw_dlc_is_capped() {
        let frame =
            CanFrame::from_raw(FrameKind::Standard, 0x10, false, 15, &[1, 2, 3, 4, 5, 6, 7, 8])
                .unwrap();
        assert_eq!(frame.dlc(), 15);
        assert_eq!(frame.data().len(), 8);
    }

    #[test]
    fn test_remote_frame_keeps_dlc() {
        let frame = CanFrame::remote_frame(FrameKind::Extended, 0x100, 4).unwrap();
        assert!(frame.is_remote());
        assert_eq!(frame.dlc(), 4);
        assert!(CanFrame::remote_frame(FrameKind::Extended, 0x100, 9).is_err());
    }

    #[test]
    fn test_display() {
        let frame = CanFrame::data_frame(FrameKind::Standard, 0x1A2, &[0x01, 0xff]).unwrap();
        assert_eq!(
            frame.to_string(),
            "Standard ID: 0x1a2      DLC: 2  Data: 0x01 0xff"
        );

        let frame = CanFrame::remote_frame(FrameKind::Extended, 0x100, 0).unwrap();
        assert_eq!(
            frame.to_string(),
            "Extended ID: 0x00000100 DLC: 0  Data: REMOTE REQUEST FRAME"
        );
    }
}
