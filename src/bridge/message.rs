//! Queue payloads
//!
//! Fixed-capacity value types handed between the workers. Each type owns
//! its bytes, so a send moves the whole value into the queue.

use std::fmt;

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::can::{BusError, CanFrame, FrameKind, MAX_DATA_LEN};
use crate::mapping::MAX_TOPIC_LEN;

/// Largest payload carried by a [`BridgeMessage`] or [`InboundMessage`]
pub const MAX_PAYLOAD_LEN: usize = 64;

/// A value does not fit its fixed-capacity container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsError {
    /// Topic length in bytes
    TopicTooLong(usize),
    /// Payload length in bytes, and the limit it exceeds
    PayloadTooLong(usize, usize),
}

impl fmt::Display for BoundsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundsError::TopicTooLong(len) => {
                write!(f, "topic is {} bytes, limit is {}", len, MAX_TOPIC_LEN)
            }
            BoundsError::PayloadTooLong(len, limit) => {
                write!(f, "payload is {} bytes, limit is {}", len, limit)
            }
        }
    }
}

impl std::error::Error for BoundsError {}

fn check_topic(topic: &str) -> Result<(), BoundsError> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err(BoundsError::TopicTooLong(topic.len()));
    }
    Ok(())
}

/// One publish request, bus -> broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMessage {
    topic: CompactString,
    payload: SmallVec<[u8; MAX_PAYLOAD_LEN]>,
}

impl BridgeMessage {
    pub fn new(topic: &str, payload: &[u8]) -> Result<Self, BoundsError> {
        check_topic(topic)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(BoundsError::PayloadTooLong(payload.len(), MAX_PAYLOAD_LEN));
        }

        Ok(Self {
            topic: CompactString::new(topic),
            payload: SmallVec::from_slice(payload),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// One transmit request, broker -> bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeFrame {
    kind: FrameKind,
    id: u32,
    payload: SmallVec<[u8; MAX_DATA_LEN]>,
}

impl BridgeFrame {
    pub fn new(kind: FrameKind, id: u32, payload: &[u8]) -> Result<Self, BoundsError> {
        if payload.len() > MAX_DATA_LEN {
            return Err(BoundsError::PayloadTooLong(payload.len(), MAX_DATA_LEN));
        }

        Ok(Self {
            kind,
            id,
            payload: SmallVec::from_slice(payload),
        })
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Data frame ready for the driver
    pub fn to_can_frame(&self) -> Result<CanFrame, BusError> {
        CanFrame::data_frame(self.kind, self.id, &self.payload)
    }
}

/// A broker delivery waiting for the subscribe worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    topic: CompactString,
    payload: SmallVec<[u8; MAX_PAYLOAD_LEN]>,
}

impl InboundMessage {
    pub fn new(topic: &str, payload: &[u8]) -> Result<Self, BoundsError> {
        check_topic(topic)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(BoundsError::PayloadTooLong(payload.len(), MAX_PAYLOAD_LEN));
        }

        Ok(Self {
            topic: CompactString::new(topic),
            payload: SmallVec::from_slice(payload),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
