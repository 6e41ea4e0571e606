//! Stream Codec
//!
//! JSON encoding for gateway frames. A frame carries either one message
//! object or an array of them. Objects without a `type` tag are treated as
//! ticks, which is how some upstream encodings deliver raw market data.

use serde_json::Value;

use crate::domain::streaming::{InboundMessage, OutboundMessage, RawTick};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is neither an object nor an array of objects.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the quote stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame into messages.
    ///
    /// Elements of an array that fail to decode are skipped with a debug
    /// log; the rest of the frame is still delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON or is not an object or
    /// array.
    pub fn decode(&self, text: &str) -> Result<Vec<InboundMessage>, CodecError> {
        match serde_json::from_str::<Value>(text.trim())? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match decode_value(item) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        tracing::debug!(error = %e, "Skipping malformed array element");
                        None
                    }
                })
                .collect()),
            value @ Value::Object(_) => Ok(vec![decode_value(value)?]),
            other => Err(CodecError::InvalidFormat(preview(&other.to_string()))),
        }
    }

    /// Encode an outbound command.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, message: &OutboundMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }
}

fn decode_value(value: Value) -> Result<InboundMessage, CodecError> {
    match value {
        Value::Object(fields) if !fields.contains_key("type") => {
            Ok(InboundMessage::Tick(Box::new(RawTick::from_fields(fields))))
        }
        value @ Value::Object(_) => Ok(serde_json::from_value(value)?),
        other => Err(CodecError::InvalidFormat(preview(&other.to_string()))),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}
