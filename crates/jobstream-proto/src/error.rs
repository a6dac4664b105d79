//! Error types for the jobstream-proto crate.

use thiserror::Error;

/// Errors that can occur while encoding protocol values.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a value.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Why a single event could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeErrorKind {
    /// The `event:` tag is not one the client understands.
    #[error("unknown event type")]
    UnknownType,

    /// The payload bytes are not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The payload does not match the schema implied by the event type.
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A single event that failed to decode.
///
/// Carries the raw payload so the failure can be logged for diagnostics. A
/// decode error is local to one event and never terminates the stream.
#[derive(Debug, Error)]
#[error("failed to decode '{event_type}' event: {cause}")]
pub struct DecodeError {
    /// The declared event type tag.
    pub event_type: String,
    /// The raw payload, lossily converted to UTF-8.
    pub raw: String,
    /// The underlying cause.
    #[source]
    pub cause: DecodeErrorKind,
}

impl DecodeError {
    pub(crate) fn new(event_type: &str, raw: &[u8], cause: impl Into<DecodeErrorKind>) -> Self {
        Self {
            event_type: event_type.to_string(),
            raw: String::from_utf8_lossy(raw).into_owned(),
            cause: cause.into(),
        }
    }
}
