//! The one error type every fallible operation returns.

use thiserror::Error;

use crate::stream::ResetReason;

#[derive(Debug, Error)]
pub enum DuplexError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration document.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A HEADERS or RST_STREAM payload could not be encoded.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// A HEADERS or RST_STREAM payload could not be decoded.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// The peer broke framing rules, or a configuration value is out of range.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Write, flush or metadata emission after `close_write`.
    #[error("Channel already closed")]
    ChannelClosed,

    /// The stream was reset by either party. Terminal for both directions.
    #[error("Stream reset: {0}")]
    StreamReset(ResetReason),

    /// A metadata frame arrived before any listener was attached.
    ///
    /// The frame is buffered and delivered on registration, so this only
    /// reports that delivery was deferred.
    #[error("No header listener registered")]
    ListenerNotRegistered,

    /// A header listener was already registered for this direction.
    #[error("Header listener already registered")]
    ListenerAlreadyRegistered,

    /// The responder callback failed. Always converted into a stream reset.
    #[error("Responder callback failed: {0}")]
    CallbackFailure(String),

    /// Frames on one direction arrived in an order the protocol forbids.
    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    /// The transport is gone; nothing more can be sent or received.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An outgoing payload is larger than the peer accepts. Nothing was sent.
    #[error("Payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: u32 },

    /// The writer task stayed full for the whole backpressure timeout.
    #[error("Timed out waiting for the writer queue to drain")]
    BackpressureTimeout,
}

impl DuplexError {
    /// The reset reason, if this error reports a stream reset.
    pub fn reset_reason(&self) -> Option<&ResetReason> {
        match self {
            DuplexError::StreamReset(reason) => Some(reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DuplexError>;
