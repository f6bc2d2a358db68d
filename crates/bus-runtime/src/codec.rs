//! Message codec boundary.
//!
//! Wire-level AMQP encoding is delegated to the transport layer; the runtime
//! only needs a way to turn a [`Message`] into an opaque payload and back,
//! bounded by the configured maximum frame size.

use crate::error::AmqpError;
use crate::message::Message;
use bytes::Bytes;

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;

/// Encoder/decoder for logical messages
pub trait MessageCodec: Send + Sync {
    /// Encode a message, failing if the payload exceeds the size ceiling
    fn encode(&self, message: &Message) -> Result<Bytes, AmqpError>;

    /// Decode a payload produced by [`MessageCodec::encode`]
    fn decode(&self, bytes: &Bytes) -> Result<Message, AmqpError>;
}

/// JSON-backed default codec with a payload-size ceiling
pub struct JsonCodec {
    max_message_size: usize,
}

impl JsonCodec {
    /// Create a codec bounded at `max_message_size` encoded bytes
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl MessageCodec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<Bytes, AmqpError> {
        let encoded = serde_json::to_vec(message)?;
        if encoded.len() > self.max_message_size {
            return Err(AmqpError::MessageTooLarge {
                size: encoded.len(),
                max_size: self.max_message_size,
            });
        }
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, bytes: &Bytes) -> Result<Message, AmqpError> {
        if bytes.len() > self.max_message_size {
            return Err(AmqpError::MessageTooLarge {
                size: bytes.len(),
                max_size: self.max_message_size,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
