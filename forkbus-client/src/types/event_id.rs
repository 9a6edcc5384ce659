//! Time-ordered 128-bit event identifier.

use super::Timestamp;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A globally unique, time-ordered event identifier (UUIDv7).
///
/// The first 48 bits hold the creation time in Unix milliseconds, so ids
/// sort in emission order (within a millisecond, by the random tail) and
/// double as a causal timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(Uuid);

/// Error returned when parsing an invalid event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEventId(String);

impl fmt::Display for InvalidEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event id '{}'", self.0)
    }
}

impl std::error::Error for InvalidEventId {}

impl EventId {
    /// Size of the binary id on the wire.
    pub const LEN: usize = 16;

    /// Creates a fresh id stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Rebuilds an id from its 16 wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16 wire bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Recovers the creation time from the 48-bit millisecond prefix.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        let bytes = self.0.as_bytes();
        let mut millis = [0u8; 8];
        millis[2..].copy_from_slice(&bytes[..6]);
        Timestamp::from_millis(u64::from_be_bytes(millis))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = InvalidEventId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| InvalidEventId(s.to_string()))
    }
}

impl Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn timestamp_is_recovered_from_id() {
        let before = Timestamp::now();
        let id = EventId::new();
        let after = Timestamp::now();

        let ts = id.timestamp();
        assert!(ts >= before && ts <= after, "{ts} not in [{before}, {after}]");
    }

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let first = EventId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EventId::new();
        assert!(first < second);
    }

    #[test]
    fn bytes_roundtrip() {
        let id = EventId::new();
        assert_eq!(EventId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not-an-id".parse::<EventId>().is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let id = EventId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        let restored: EventId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, restored);
    }
}
