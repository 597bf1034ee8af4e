//! JSON codec for envelopes and messages.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::message::Message;

/// Maximum accepted inbound payload (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors raised while encoding or decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload exceeds [`MAX_FRAME_SIZE`].
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Payload is not valid JSON of the expected shape.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode an inbound envelope.
///
/// # Errors
///
/// Returns an error if the payload is too large or not an envelope.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    Ok(serde_json::from_slice(data)?)
}

/// Encode an envelope, e.g. to forward it onto the bus.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Encode an outbound message as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_message(message: &Message) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}
