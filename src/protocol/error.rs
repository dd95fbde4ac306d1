//! Codec errors

use std::fmt;

/// Why a buffer could not be turned into a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are needed; not fatal for a stream
    InsufficientData,
    InvalidPacketType(u8),
    /// Remaining length runs past four bytes
    InvalidRemainingLength,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Fixed-header or CONNECT/SUBSCRIBE flags outside the allowed set
    InvalidFlags,
    InvalidReturnCode(u8),
    MalformedPacket(&'static str),
    /// Remaining length above the decoder limit
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InsufficientData => f.write_str("incomplete packet"),
            DecodeError::InvalidPacketType(kind) => write!(f, "unsupported packet type {}", kind),
            DecodeError::InvalidRemainingLength => f.write_str("bad remaining length"),
            DecodeError::InvalidProtocolName => f.write_str("protocol name is not MQTT"),
            DecodeError::InvalidProtocolVersion(level) => {
                write!(f, "unsupported protocol level {}", level)
            }
            DecodeError::InvalidQoS(qos) => write!(f, "bad QoS {}", qos),
            DecodeError::InvalidUtf8 => f.write_str("string is not UTF-8"),
            DecodeError::InvalidFlags => f.write_str("reserved flags set"),
            DecodeError::InvalidReturnCode(code) => write!(f, "unknown return code {}", code),
            DecodeError::MalformedPacket(reason) => write!(f, "malformed packet ({})", reason),
            DecodeError::PacketTooLarge => f.write_str("packet exceeds size limit"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a packet could not be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Body longer than a remaining-length field can describe
    PacketTooLarge,
    /// Field longer than a u16 length prefix allows
    StringTooLong,
    /// Empty topic or one containing wildcards
    InvalidTopicName,
    EmptySubscribe,
    /// QoS 1 or 2 publish without an identifier
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            EncodeError::PacketTooLarge => "packet exceeds size limit",
            EncodeError::StringTooLong => "field longer than 65535 bytes",
            EncodeError::InvalidTopicName => "topic name is empty or has wildcards",
            EncodeError::EmptySubscribe => "no topic filters to subscribe",
            EncodeError::MissingPacketId => "packet identifier required",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for EncodeError {}
