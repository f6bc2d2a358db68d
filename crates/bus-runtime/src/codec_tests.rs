//! Tests for the message codec.

use super::*;
use crate::message::SessionId;

#[test]
fn encode_decode_preserves_message() {
    let codec = JsonCodec::new(64 * 1024);
    let message = Message::new("payload")
        .with_session_id(SessionId::new("s1").unwrap())
        .with_property("k", "v");

    let encoded = codec.encode(&message).unwrap();
    let decoded = codec.decode(&encoded).unwrap();

    assert_eq!(decoded.message_id, message.message_id);
    assert_eq!(decoded.body, message.body);
    assert_eq!(decoded.session_id, message.session_id);
    assert_eq!(decoded.properties, message.properties);
}

#[test]
fn oversized_payload_is_rejected_on_encode() {
    let codec = JsonCodec::new(64);
    let message = Message::new(vec![b'x'; 256]);

    match codec.encode(&message) {
        Err(AmqpError::MessageTooLarge { size, max_size }) => {
            assert!(size > max_size);
            assert_eq!(max_size, 64);
        }
        other => panic!("expected MessageTooLarge, got: {other:?}"),
    }
}

#[test]
fn oversized_payload_is_rejected_on_decode() {
    let codec = JsonCodec::new(8);
    let bytes = Bytes::from(vec![b'x'; 64]);
    assert!(matches!(
        codec.decode(&bytes),
        Err(AmqpError::MessageTooLarge { .. })
    ));
}

#[test]
fn garbage_fails_to_decode() {
    let codec = JsonCodec::new(1024);
    let bytes = Bytes::from_static(b"not json");
    assert!(matches!(
        codec.decode(&bytes),
        Err(AmqpError::Serialization(_))
    ));
}
