//! MQTT Codec Tests
//!
//! Byte-level checks against MQTT v3.1.1 sections 2 and 3.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, Packet, PubAck, Publish, QoS,
    SubAck, Subscribe, SubscribeReturnCode, Subscription,
};

// ============================================================================
// Helpers
// ============================================================================

fn encode(packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf.to_vec()
}

fn decode(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, len)) => {
            assert_eq!(len, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

// ============================================================================
// Variable Byte Integer
// ============================================================================

#[test]
fn test_variable_int_boundaries() {
    let cases: &[(u32, &[u8])] = &[
        (0, &[0x00]),
        (127, &[0x7F]),
        (128, &[0x80, 0x01]),
        (16_383, &[0xFF, 0x7F]),
        (16_384, &[0x80, 0x80, 0x01]),
        (268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F]),
    ];

    for (value, bytes) in cases {
        let mut buf = BytesMut::new();
        assert_eq!(write_variable_int(&mut buf, *value).unwrap(), bytes.len());
        assert_eq!(&buf[..], *bytes);
        assert_eq!(read_variable_int(bytes).unwrap(), (*value, bytes.len()));
    }
}

#[test]
fn test_variable_int_errors() {
    assert_eq!(
        read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
    assert_eq!(read_variable_int(&[0x80]), Err(DecodeError::InsufficientData));

    let mut buf = BytesMut::new();
    assert_eq!(
        write_variable_int(&mut buf, 268_435_456),
        Err(EncodeError::PacketTooLarge)
    );
}

// ============================================================================
// CONNECT / CONNACK (MQTT-3.1, MQTT-3.2)
// ============================================================================

#[test]
fn test_connect_bytes() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "sub-x".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
    }));

    #[rustfmt::skip]
    let expected = vec![
        0x10, 0x11,
        0x00, 0x04, b'M', b'Q', b'T', b'T',
        0x04,       // protocol level
        0x02,       // clean session
        0x00, 0x3C, // keep alive
        0x00, 0x05, b's', b'u', b'b', b'-', b'x',
    ];
    assert_eq!(encode(&packet), expected);
    assert_eq!(decode(&expected).unwrap(), packet);
}

#[test]
fn test_connect_with_credentials() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "pub-node".to_string(),
        clean_session: true,
        keep_alive: 30,
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"secret")),
    }));

    let encoded = encode(&packet);
    // username and password flags
    assert_eq!(encoded[9], 0xC2);
    assert_eq!(decode(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_rejects_other_protocol_level() {
    let mut bytes = encode(&Packet::Connect(Box::default()));
    bytes[8] = 5;
    assert_eq!(decode(&bytes), Err(DecodeError::InvalidProtocolVersion(5)));
}

#[test]
fn test_connack_return_codes() {
    let accepted = decode(&[0x20, 0x02, 0x01, 0x00]).unwrap();
    assert_eq!(
        accepted,
        Packet::ConnAck(ConnAck {
            session_present: true,
            return_code: ConnectReturnCode::Accepted,
        })
    );

    let refused = decode(&[0x20, 0x02, 0x00, 0x05]).unwrap();
    assert_eq!(
        refused,
        Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::NotAuthorized,
        })
    );

    assert_eq!(
        decode(&[0x20, 0x02, 0x00, 0x06]),
        Err(DecodeError::InvalidReturnCode(6))
    );
    assert_eq!(decode(&[0x20, 0x02, 0x02, 0x00]), Err(DecodeError::InvalidFlags));
}

// ============================================================================
// PUBLISH / PUBACK (MQTT-3.3, MQTT-3.4)
// ============================================================================

#[test]
fn test_publish_qos1_bytes() {
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "a/b".to_string(),
        packet_id: Some(1),
        payload: Bytes::from_static(&[0x01, 0x02]),
    });

    #[rustfmt::skip]
    let expected = vec![
        0x32, 0x09,
        0x00, 0x03, b'a', b'/', b'b',
        0x00, 0x01,
        0x01, 0x02,
    ];
    assert_eq!(encode(&packet), expected);
    assert_eq!(decode(&expected).unwrap(), packet);
}

#[test]
fn test_publish_qos0_has_no_packet_id() {
    let bytes = [0x30, 0x04, 0x00, 0x01, b't', 0xAA];
    assert_eq!(
        decode(&bytes).unwrap(),
        Packet::Publish(Publish {
            topic: "t".to_string(),
            payload: Bytes::from_static(&[0xAA]),
            ..Default::default()
        })
    );
}

#[test]
fn test_publish_empty_payload() {
    let bytes = [0x30, 0x03, 0x00, 0x01, b't'];
    match decode(&bytes).unwrap() {
        Packet::Publish(p) => assert!(p.payload.is_empty()),
        other => panic!("unexpected packet {:?}", other),
    }
}

#[test]
fn test_publish_long_payload_uses_two_length_bytes() {
    let packet = Packet::Publish(Publish {
        topic: "t".to_string(),
        payload: Bytes::from(vec![0u8; 200]),
        ..Default::default()
    });
    let encoded = encode(&packet);
    // 3 (topic) + 200 (payload) = 203
    assert_eq!(&encoded[..3], &[0x30, 0xCB, 0x01]);
    assert_eq!(decode(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_encode_rejects_invalid() {
    let mut buf = BytesMut::new();
    let wildcard = Packet::Publish(Publish {
        topic: "a/#".to_string(),
        ..Default::default()
    });
    assert_eq!(
        Encoder::new().encode(&wildcard, &mut buf),
        Err(EncodeError::InvalidTopicName)
    );

    let no_id = Packet::Publish(Publish {
        topic: "a".to_string(),
        qos: QoS::AtLeastOnce,
        ..Default::default()
    });
    assert_eq!(
        Encoder::new().encode(&no_id, &mut buf),
        Err(EncodeError::MissingPacketId)
    );
}

#[test]
fn test_publish_decode_rejects_wildcard_and_zero_id() {
    assert!(matches!(
        decode(&[0x30, 0x03, 0x00, 0x01, b'#']),
        Err(DecodeError::MalformedPacket(_))
    ));
    assert!(matches!(
        decode(&[0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00]),
        Err(DecodeError::MalformedPacket(_))
    ));
    assert_eq!(
        decode(&[0x36, 0x03, 0x00, 0x01, b't']),
        Err(DecodeError::InvalidQoS(3))
    );
}

#[test]
fn test_puback_bytes() {
    let packet = Packet::PubAck(PubAck::new(0x1234));
    assert_eq!(encode(&packet), vec![0x40, 0x02, 0x12, 0x34]);
    assert_eq!(decode(&[0x40, 0x02, 0x12, 0x34]).unwrap(), packet);
}

// ============================================================================
// SUBSCRIBE / SUBACK (MQTT-3.8, MQTT-3.9)
// ============================================================================

#[test]
fn test_subscribe_bytes() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 7,
        subscriptions: vec![Subscription {
            filter: "ctrl/fan".to_string(),
            qos: QoS::AtMostOnce,
        }],
    });

    let mut expected = vec![0x82, 0x0D, 0x00, 0x07, 0x00, 0x08];
    expected.extend_from_slice(b"ctrl/fan");
    expected.push(0x00);

    assert_eq!(encode(&packet), expected);
    assert_eq!(decode(&expected).unwrap(), packet);
}

#[test]
fn test_subscribe_requires_filters() {
    let mut buf = BytesMut::new();
    let empty = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![],
    });
    assert_eq!(
        Encoder::new().encode(&empty, &mut buf),
        Err(EncodeError::EmptySubscribe)
    );
    assert!(matches!(
        decode(&[0x82, 0x02, 0x00, 0x01]),
        Err(DecodeError::MalformedPacket(_))
    ));
    assert_eq!(
        decode(&[0x80, 0x02, 0x00, 0x01]),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn test_suback_return_codes() {
    let bytes = [0x90, 0x04, 0x00, 0x07, 0x00, 0x80];
    let expected = Packet::SubAck(SubAck {
        packet_id: 7,
        return_codes: vec![
            SubscribeReturnCode::Success(QoS::AtMostOnce),
            SubscribeReturnCode::Failure,
        ],
    });
    assert_eq!(decode(&bytes).unwrap(), expected);
    assert_eq!(encode(&expected), bytes.to_vec());
}

// ============================================================================
// Control packets and framing
// ============================================================================

#[test]
fn test_control_packets() {
    assert_eq!(encode(&Packet::PingReq), vec![0xC0, 0x00]);
    assert_eq!(encode(&Packet::PingResp), vec![0xD0, 0x00]);
    assert_eq!(encode(&Packet::Disconnect), vec![0xE0, 0x00]);

    assert_eq!(decode(&[0xD0, 0x00]).unwrap(), Packet::PingResp);
    assert_eq!(decode(&[0xC1, 0x00]), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_unsupported_packet_type() {
    // PUBREC is QoS 2 only
    assert_eq!(
        decode(&[0x50, 0x02, 0x00, 0x01]),
        Err(DecodeError::InvalidPacketType(5))
    );
}

#[test]
fn test_partial_packet_waits_for_more() {
    let full = encode(&Packet::PubAck(PubAck::new(9)));
    let mut decoder = Decoder::new();

    assert_eq!(decoder.decode(&full[..1]).unwrap(), None);
    assert_eq!(decoder.decode(&full[..3]).unwrap(), None);
    assert!(decoder.decode(&full).unwrap().is_some());
}

#[test]
fn test_back_to_back_packets() {
    let mut buf = encode(&Packet::PingResp);
    buf.extend(encode(&Packet::PubAck(PubAck::new(3))));

    let mut decoder = Decoder::new();
    let (first, used) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    assert_eq!(used, 2);

    let (second, used2) = decoder.decode(&buf[used..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubAck(PubAck::new(3)));
    assert_eq!(used + used2, buf.len());
}

#[test]
fn test_packet_size_limit() {
    let mut decoder = Decoder::new().with_max_packet_size(16);
    let packet = encode(&Packet::Publish(Publish {
        topic: "t".to_string(),
        payload: Bytes::from(vec![0u8; 32]),
        ..Default::default()
    }));
    assert_eq!(decoder.decode(&packet), Err(DecodeError::PacketTooLarge));
}
