//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_variable_int, Reader, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, PubAck, Publish, QoS,
    SubAck, Subscribe, SubscribeReturnCode, Subscription, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

const CONNECT_RESERVED: u8 = 0x01;
const CONNECT_CLEAN_SESSION: u8 = 0x02;
/// Will flag, will QoS and will retain
const CONNECT_WILL_BITS: u8 = 0x3C;
const CONNECT_PASSWORD: u8 = 0x40;
const CONNECT_USERNAME: u8 = 0x80;

/// Incremental decoder: feed it the receive buffer, consume what it reports
pub struct Decoder {
    /// Largest remaining length accepted
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode the first packet in `buf`.
    ///
    /// Returns `Ok(None)` until the buffer holds a complete packet, then the
    /// packet and the number of bytes it occupied.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&header) = buf.first() else {
            return Ok(None);
        };

        let (body_len, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(field) => field,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body_len = body_len as usize;
        if body_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let start = 1 + len_bytes;
        let Some(body) = buf.get(start..start + body_len) else {
            return Ok(None);
        };

        let flags = header & 0x0F;
        let Some(kind) = PacketType::from_u8(header >> 4) else {
            return Err(DecodeError::InvalidPacketType(header >> 4));
        };
        match kind {
            PacketType::Publish => {}
            PacketType::Subscribe => expect_flags(flags, 0x02)?,
            _ => expect_flags(flags, 0)?,
        }

        let mut reader = Reader::new(body);
        let packet = match kind {
            PacketType::Connect => decode_connect(&mut reader)?,
            PacketType::ConnAck => decode_connack(&mut reader)?,
            PacketType::Publish => decode_publish(flags, &mut reader)?,
            PacketType::PubAck => decode_puback(&mut reader)?,
            PacketType::Subscribe => decode_subscribe(&mut reader)?,
            PacketType::SubAck => decode_suback(&mut reader)?,
            PacketType::PingReq => empty(&reader, Packet::PingReq)?,
            PacketType::PingResp => empty(&reader, Packet::PingResp)?,
            PacketType::Disconnect => empty(&reader, Packet::Disconnect)?,
        };

        Ok(Some((packet, start + body_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(())
}

fn empty(reader: &Reader<'_>, packet: Packet) -> Result<Packet, DecodeError> {
    if !reader.is_empty() {
        return Err(DecodeError::MalformedPacket("unexpected payload"));
    }
    Ok(packet)
}

fn decode_connect(reader: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    if reader.string()? != PROTOCOL_NAME {
        return Err(DecodeError::InvalidProtocolName);
    }

    let level = reader.u8()?;
    if level != PROTOCOL_LEVEL {
        return Err(DecodeError::InvalidProtocolVersion(level));
    }

    let flags = reader.u8()?;
    let keep_alive = reader.u16()?;

    // Wills are never sent by the bridge
    if flags & (CONNECT_RESERVED | CONNECT_WILL_BITS) != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let has_username = flags & CONNECT_USERNAME != 0;
    let has_password = flags & CONNECT_PASSWORD != 0;
    if has_password && !has_username {
        return Err(DecodeError::InvalidFlags);
    }

    let client_id = reader.string()?.to_string();
    let username = if has_username {
        Some(reader.string()?.to_string())
    } else {
        None
    };
    let password = if has_password {
        Some(Bytes::copy_from_slice(reader.binary()?))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        client_id,
        clean_session: flags & CONNECT_CLEAN_SESSION != 0,
        keep_alive,
        username,
        password,
    })))
}

fn decode_connack(reader: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let ack_flags = reader.u8()?;
    let code = reader.u8()?;
    if !reader.is_empty() {
        return Err(DecodeError::MalformedPacket("CONNACK length must be 2"));
    }
    // Bit 0 is session present, the rest is reserved
    if ack_flags & 0xFE != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        return_code: ConnectReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))?,
    }))
}

fn decode_publish(flags: u8, reader: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let qos_bits = (flags >> 1) & 0x03;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
    let dup = flags & 0x08 != 0;
    if dup && qos == QoS::AtMostOnce {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let topic = reader.string()?;
    if topic.contains(['+', '#']) {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }
    let topic = topic.to_string();

    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(reader.packet_id()?),
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(reader.rest()),
    }))
}

fn decode_puback(reader: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let packet_id = reader.u16()?;
    if !reader.is_empty() {
        return Err(DecodeError::MalformedPacket("PUBACK length must be 2"));
    }
    Ok(Packet::PubAck(PubAck::new(packet_id)))
}

fn decode_subscribe(reader: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let packet_id = reader.packet_id()?;

    let mut subscriptions = Vec::new();
    while !reader.is_empty() {
        let filter = reader.string()?.to_string();
        let options = reader.u8()?;
        if options & 0xFC != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;
        subscriptions.push(Subscription { filter, qos });
    }

    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE without topic filters"));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(reader: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let packet_id = reader.u16()?;
    let return_codes = reader
        .rest()
        .iter()
        .map(|&code| SubscribeReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}
