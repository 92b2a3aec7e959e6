//! Stream Frame Codec
//!
//! JSON encode/decode for the Finnhub WebSocket protocol. Decode errors
//! are surfaced so the caller can log and drop the frame; a malformed
//! frame never tears down the connection.

use serde::Serialize;

use super::messages::StreamMessage;

/// Codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON codec for stream frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamCodec;

impl StreamCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decodes one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] for malformed JSON or frames with an
    /// unknown `type` tag.
    pub fn decode(&self, text: &str) -> Result<StreamMessage, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encodes an outbound frame to a text payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if serialization fails.
    pub fn encode<T: Serialize>(&self, frame: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(frame)?)
    }
}
