//! The binary Event envelope.
//!
//! Every unit of traffic between a worker and its supervisor is an
//! [`Event`]: a three-letter type tag, a time-ordered id and an opaque
//! payload. The layout is fixed:
//!
//! ```text
//! +---------+----------+-------------+-----------+
//! | tag [3] | id [16]  | len u32 BE  | data[len] |
//! +---------+----------+-------------+-----------+
//! ```
//!
//! Events are created at the point of emission, encoded once, decoded at
//! most once per hop and then dropped; only their typed payloads
//! ([`LogRecord`](crate::LogRecord), [`Crash`](crate::Crash),
//! [`TopicEvent`](crate::TopicEvent)) are ever retained.

use crate::error::{DecodeError, EventError};
use crate::types::{EventId, EventType, Timestamp};
use serde::{de::DeserializeOwned, Serialize};

/// Maximum payload size in bytes.
pub const MAX_DATA_SIZE: usize = 10_000_000;

/// Size of the fixed envelope header (tag, id, payload length).
pub const HEADER_LEN: usize = 3 + EventId::LEN + 4;

/// An immutable, self-describing unit of transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    id: EventId,
    kind: EventType,
    data: Vec<u8>,
}

impl Event {
    /// Create an Event with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns an error if `kind` is not three uppercase letters or the
    /// payload exceeds [`MAX_DATA_SIZE`]. Nothing is ever truncated.
    pub fn create(kind: &str, data: impl Into<Vec<u8>>) -> Result<Self, EventError> {
        let kind = EventType::new(kind)?;
        Self::with_id(EventId::new(), kind, data)
    }

    /// Create an Event with an explicit id and an already validated tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds [`MAX_DATA_SIZE`].
    pub fn with_id(
        id: EventId,
        kind: EventType,
        data: impl Into<Vec<u8>>,
    ) -> Result<Self, EventError> {
        let data = data.into();
        if data.len() > MAX_DATA_SIZE {
            return Err(EventError::PayloadTooLarge {
                size: data.len(),
                max: MAX_DATA_SIZE,
            });
        }
        Ok(Self { id, kind, data })
    }

    /// Serialize `payload` as named MessagePack and wrap it.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the result is too large.
    pub fn from_payload<T: Serialize>(
        id: EventId,
        kind: EventType,
        payload: &T,
    ) -> Result<Self, EventError> {
        let data = rmp_serde::to_vec_named(payload)?;
        Self::with_id(id, kind, data)
    }

    /// Deserialize the payload, checking the tag first.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::TypeMismatch`] if the tag differs from
    /// `expected`, or a decode error if the payload is malformed.
    pub fn payload_as<T: DeserializeOwned>(&self, expected: EventType) -> Result<T, EventError> {
        if self.kind != expected {
            return Err(EventError::TypeMismatch {
                expected,
                actual: self.kind,
            });
        }
        Ok(rmp_serde::from_slice(&self.data)?)
    }

    /// The event id.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// The type tag.
    #[must_use]
    pub fn kind(&self) -> EventType {
        self.kind
    }

    /// The raw payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Approximate creation time, recovered from the id.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.id.timestamp()
    }

    /// Encode to the binary envelope layout.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(self.kind.as_bytes());
        out.extend_from_slice(self.id.as_bytes());
        // Bounded by MAX_DATA_SIZE at construction.
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode from the binary envelope layout.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for short input, an invalid tag, an
    /// oversized or inconsistent payload length.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }

        let (tag, rest) = bytes.split_at(3);
        let (id, rest) = rest.split_at(EventId::LEN);
        let (len, data) = rest.split_at(4);

        let mut tag_bytes = [0u8; 3];
        tag_bytes.copy_from_slice(tag);
        let kind = EventType::from_bytes(tag_bytes).map_err(|_| DecodeError::InvalidTag(tag_bytes))?;

        let mut id_bytes = [0u8; EventId::LEN];
        id_bytes.copy_from_slice(id);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(len);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_DATA_SIZE {
            return Err(DecodeError::PayloadTooLarge(len));
        }
        if data.len() < len {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN + len,
                available: bytes.len(),
            });
        }
        if data.len() > len {
            return Err(DecodeError::TrailingBytes(data.len() - len));
        }

        Ok(Self {
            id: EventId::from_bytes(id_bytes),
            kind,
            data: data.to_vec(),
        })
    }
}
