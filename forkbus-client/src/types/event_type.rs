//! Three-letter event type tag.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A validated event type tag: exactly three ASCII uppercase letters.
///
/// The tag is the only part of an Event the transport interprets; the
/// supervisor demultiplexes on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventType([u8; 3]);

/// Error returned when creating an invalid event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEventType {
    value: String,
}

impl InvalidEventType {
    /// The rejected input.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for InvalidEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event type '{}' must be exactly three uppercase ASCII letters",
            self.value
        )
    }
}

impl std::error::Error for InvalidEventType {}

impl EventType {
    /// Structured log record.
    pub const LOG: Self = Self(*b"LOG");
    /// Fatal crash report.
    pub const CRASH: Self = Self(*b"CRA");
    /// Topic subscription signal or value.
    pub const TOPIC: Self = Self(*b"TOP");

    /// Creates a new event type after validation.
    ///
    /// # Errors
    ///
    /// Returns an error unless `value` matches `^[A-Z]{3}$`.
    pub fn new(value: &str) -> Result<Self, InvalidEventType> {
        let bytes = value.as_bytes();
        match <[u8; 3]>::try_from(bytes) {
            Ok(tag) => Self::from_bytes(tag),
            Err(_) => Err(InvalidEventType {
                value: value.to_string(),
            }),
        }
    }

    /// Validates a raw wire tag.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte is not an ASCII uppercase letter.
    pub fn from_bytes(tag: [u8; 3]) -> Result<Self, InvalidEventType> {
        if tag.iter().all(u8::is_ascii_uppercase) {
            Ok(Self(tag))
        } else {
            Err(InvalidEventType {
                value: String::from_utf8_lossy(&tag).into_owned(),
            })
        }
    }

    /// Returns the raw wire tag.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Only ASCII uppercase letters are ever stored.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = InvalidEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}
