//! Error types for the forkbus client library.

use crate::crash::Crash;
use crate::types::{EventType, InvalidEventType};
use thiserror::Error;

/// Errors raised when building or interpreting Events.
///
/// Construction-time envelope violations are the only errors the core
/// surfaces to callers; everything in steady state becomes a stream event
/// or a warning instead.
#[derive(Debug, Error)]
pub enum EventError {
    /// The type tag does not match `^[A-Z]{3}$`.
    #[error(transparent)]
    InvalidType(#[from] InvalidEventType),

    /// The payload exceeds the envelope size limit.
    #[error("event payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// The Event carries a different tag than the decoder expects.
    #[error("type mismatch: expected {expected} event, got {actual}")]
    TypeMismatch {
        expected: EventType,
        actual: EventType,
    },

    /// The typed payload could not be serialized.
    #[error("payload encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The typed payload could not be deserialized.
    #[error("payload decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A topic event violates the signal/data invariant.
    #[error("invalid topic event: {0}")]
    InvalidTopicEvent(String),
}

/// Errors raised when decoding raw envelope bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes than the envelope header or declared payload.
    #[error("truncated envelope: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// The type tag is not three uppercase letters.
    #[error("invalid type tag {0:?}")]
    InvalidTag([u8; 3]),

    /// The declared payload length exceeds the envelope limit.
    #[error("declared payload of {0} bytes exceeds the envelope limit")]
    PayloadTooLarge(usize),

    /// Bytes remain after the declared payload.
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),

    /// A stdio frame header announced more bytes than any envelope can hold.
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    OversizedFrame(usize),
}

/// Errors that can occur when running a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Failed to set up a signal handler.
    #[error("failed to set up signal handler: {0}")]
    SignalHandlerFailed(String),

    /// The worker body failed; the crash has been reported to the supervisor.
    #[error("worker crashed: {0}")]
    Crashed(Box<Crash>),
}

/// Result type for worker functions.
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;
