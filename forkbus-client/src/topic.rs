//! Topic events: subscription signals and published values.

use crate::error::EventError;
use crate::event::Event;
use crate::types::{EventId, EventType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic signal, encoded on the wire as its index in `[OFF, ON, IN, OUT]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicSignal {
    /// The last local subscriber detached.
    Off,
    /// The first local subscriber attached.
    On,
    /// A value arriving into a process for its local subscribers.
    In,
    /// A value published by a local producer.
    Out,
}

impl TopicSignal {
    const ORDER: [Self; 4] = [Self::Off, Self::On, Self::In, Self::Out];

    /// Wire index of this signal.
    #[must_use]
    pub fn index(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::In => 2,
            Self::Out => 3,
        }
    }

    /// Signal for a wire index.
    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ORDER.get(usize::from(index)).copied()
    }

    /// Whether this signal carries a value.
    #[must_use]
    pub fn carries_data(self) -> bool {
        matches!(self, Self::In | Self::Out)
    }
}

impl fmt::Display for TopicSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "OFF"),
            Self::On => write!(f, "ON"),
            Self::In => write!(f, "IN"),
            Self::Out => write!(f, "OUT"),
        }
    }
}

/// A `TOP` Event payload.
///
/// `ON`/`OFF` never carry data; `IN`/`OUT` always do. The constructors are
/// the only way to build one, so the invariant holds for every value.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicEvent {
    sub: String,
    signal: TopicSignal,
    queue: Option<String>,
    data: Option<serde_json::Value>,
}

/// Compact wire shape: short keys, integer signal.
#[derive(Serialize, Deserialize)]
struct TopicWire {
    s: String,
    g: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    q: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    d: Option<serde_json::Value>,
}

/// A present `d` key is always `Some`, even when the value is `null`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl TopicEvent {
    /// First local subscriber attached to `sub`.
    #[must_use]
    pub fn on(sub: impl Into<String>, queue: Option<String>) -> Self {
        Self {
            sub: sub.into(),
            signal: TopicSignal::On,
            queue,
            data: None,
        }
    }

    /// Last local subscriber detached from `sub`.
    #[must_use]
    pub fn off(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            signal: TopicSignal::Off,
            queue: None,
            data: None,
        }
    }

    /// A value delivered into a process.
    #[must_use]
    pub fn inbound(sub: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            sub: sub.into(),
            signal: TopicSignal::In,
            queue: None,
            data: Some(data),
        }
    }

    /// A value published by a local producer.
    #[must_use]
    pub fn outbound(sub: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            sub: sub.into(),
            signal: TopicSignal::Out,
            queue: None,
            data: Some(data),
        }
    }

    /// Topic name.
    #[must_use]
    pub fn sub(&self) -> &str {
        &self.sub
    }

    /// Signal kind.
    #[must_use]
    pub fn signal(&self) -> TopicSignal {
        self.signal
    }

    /// Competing-consumer group requested with `ON`.
    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Published value for `IN`/`OUT`.
    #[must_use]
    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    /// Consume into the published value.
    #[must_use]
    pub fn into_data(self) -> Option<serde_json::Value> {
        self.data
    }

    /// Re-address an `OUT` value as `IN` for delivery.
    #[must_use]
    pub fn to_inbound(&self) -> Option<Self> {
        match (self.signal, &self.data) {
            (TopicSignal::Out | TopicSignal::In, Some(data)) => {
                Some(Self::inbound(self.sub.clone(), data.clone()))
            }
            _ => None,
        }
    }

    /// Wrap as a `TOP` Event.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoded value exceeds the envelope limit.
    pub fn to_event(&self) -> Result<Event, EventError> {
        let wire = TopicWire {
            s: self.sub.clone(),
            g: self.signal.index(),
            q: self.queue.clone(),
            d: self.data.clone(),
        };
        Event::from_payload(EventId::new(), EventType::TOPIC, &wire)
    }

    /// Decode from a `TOP` Event.
    ///
    /// # Errors
    ///
    /// Returns an error on a tag mismatch, a malformed payload, an unknown
    /// signal index, or a signal/data combination that breaks the invariant.
    pub fn from_event(event: &Event) -> Result<Self, EventError> {
        let wire: TopicWire = event.payload_as(EventType::TOPIC)?;
        let signal = TopicSignal::from_index(wire.g).ok_or_else(|| {
            EventError::InvalidTopicEvent(format!("unknown signal index {}", wire.g))
        })?;

        if signal.carries_data() != wire.d.is_some() {
            return Err(EventError::InvalidTopicEvent(format!(
                "{signal} on '{}' {} data",
                wire.s,
                if signal.carries_data() { "requires" } else { "must not carry" }
            )));
        }

        Ok(Self {
            sub: wire.s,
            signal,
            queue: wire.q,
            data: wire.d,
        })
    }
}
