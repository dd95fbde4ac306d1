//! MQTT Packet Encoder
//!
//! Each packet body is assembled first; the fixed header is written once
//! its length is known.

use bytes::{BufMut, BytesMut};

use super::{put_prefixed, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, PacketType, Publish, QoS, SubAck, Subscribe,
    PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// Stateless packet encoder
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Append the wire form of `packet` to `buf`
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();

        let (kind, flags) = match packet {
            Packet::Connect(connect) => (PacketType::Connect, connect_body(connect, &mut body)?),
            Packet::ConnAck(ack) => (PacketType::ConnAck, connack_body(ack, &mut body)),
            Packet::Publish(publish) => (PacketType::Publish, publish_body(publish, &mut body)?),
            Packet::PubAck(ack) => {
                body.put_u16(ack.packet_id);
                (PacketType::PubAck, 0)
            }
            Packet::Subscribe(subscribe) => {
                (PacketType::Subscribe, subscribe_body(subscribe, &mut body)?)
            }
            Packet::SubAck(ack) => (PacketType::SubAck, suback_body(ack, &mut body)),
            Packet::PingReq => (PacketType::PingReq, 0),
            Packet::PingResp => (PacketType::PingResp, 0),
            Packet::Disconnect => (PacketType::Disconnect, 0),
        };

        buf.reserve(body.len() + 5);
        buf.put_u8(((kind as u8) << 4) | flags);
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }
}

// Each body writer returns the low nibble of the fixed header.

fn connect_body(connect: &Connect, body: &mut BytesMut) -> Result<u8, EncodeError> {
    put_prefixed(body, PROTOCOL_NAME.as_bytes())?;
    body.put_u8(PROTOCOL_LEVEL);

    let mut connect_flags = 0u8;
    if connect.clean_session {
        connect_flags |= 0x02;
    }
    if connect.password.is_some() {
        connect_flags |= 0x40;
    }
    if connect.username.is_some() {
        connect_flags |= 0x80;
    }
    body.put_u8(connect_flags);
    body.put_u16(connect.keep_alive);

    put_prefixed(body, connect.client_id.as_bytes())?;
    if let Some(username) = &connect.username {
        put_prefixed(body, username.as_bytes())?;
    }
    if let Some(password) = &connect.password {
        put_prefixed(body, password)?;
    }
    Ok(0)
}

fn connack_body(ack: &ConnAck, body: &mut BytesMut) -> u8 {
    body.put_u8(ack.session_present as u8);
    body.put_u8(ack.return_code as u8);
    0
}

fn publish_body(publish: &Publish, body: &mut BytesMut) -> Result<u8, EncodeError> {
    if publish.topic.is_empty() || publish.topic.contains(['+', '#']) {
        return Err(EncodeError::InvalidTopicName);
    }

    put_prefixed(body, publish.topic.as_bytes())?;
    if publish.qos != QoS::AtMostOnce {
        let packet_id = publish.packet_id.ok_or(EncodeError::MissingPacketId)?;
        body.put_u16(packet_id);
    }
    body.put_slice(&publish.payload);

    Ok(((publish.dup as u8) << 3) | ((publish.qos as u8) << 1) | publish.retain as u8)
}

fn subscribe_body(subscribe: &Subscribe, body: &mut BytesMut) -> Result<u8, EncodeError> {
    if subscribe.subscriptions.is_empty() {
        return Err(EncodeError::EmptySubscribe);
    }

    body.put_u16(subscribe.packet_id);
    for subscription in &subscribe.subscriptions {
        put_prefixed(body, subscription.filter.as_bytes())?;
        body.put_u8(subscription.qos as u8);
    }
    // Reserved flags for SUBSCRIBE
    Ok(0x02)
}

fn suback_body(ack: &SubAck, body: &mut BytesMut) -> u8 {
    body.put_u16(ack.packet_id);
    for code in &ack.return_codes {
        body.put_u8(code.to_u8());
    }
    0
}
