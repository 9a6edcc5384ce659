//! Structured log records carried by `LOG` events.

use crate::error::EventError;
use crate::event::Event;
use crate::metric::MetricMutation;
use crate::types::{EventId, EventType, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tag naming the originating resource kind.
pub const SRC_TAG: &str = "src";

/// Fallback used when a record lacks resource tags.
const UNKNOWN: &str = "unknown";

/// Severity of a log record. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "DBG")]
    Dbg,
    #[serde(rename = "ERR")]
    Err,
    #[serde(rename = "INF")]
    Inf,
    #[serde(rename = "WAR")]
    War,
}

impl LogLevel {
    /// The three-letter wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dbg => "DBG",
            Self::Err => "ERR",
            Self::Inf => "INF",
            Self::War => "WAR",
        }
    }

    /// Debug records stay local: they are never stored or persisted.
    #[must_use]
    pub fn is_debug(self) -> bool {
        self == Self::Dbg
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the resource instance that produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind, the value of the `src` tag.
    pub kind: String,
    /// Instance name, the value of the tag keyed by `kind`.
    pub instance: String,
}

impl ResourceKey {
    #[must_use]
    pub fn new(kind: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.instance)
    }
}

/// One structured diagnostic entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,

    /// Short machine-readable identifier.
    pub code: String,

    /// Always holds `src` and an entry keyed by the `src` value.
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Metric name to the mutation it applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, MetricMutation>>,

    /// Creation time.
    pub time: Timestamp,
}

impl LogRecord {
    /// Create a record for the resource `src`/`instance`.
    #[must_use]
    pub fn new(
        level: LogLevel,
        code: impl Into<String>,
        src: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        let src = src.into();
        let mut tags = BTreeMap::new();
        tags.insert(src.clone(), instance.into());
        tags.insert(SRC_TAG.to_string(), src);
        Self {
            level,
            code: code.into(),
            tags,
            data: None,
            metrics: None,
            time: Timestamp::now(),
        }
    }

    /// Attach free-form data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Add a tag. The resource tags cannot be overwritten this way.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let src = self.tags.get(SRC_TAG).cloned();
        if key == SRC_TAG || src.as_deref() == Some(key.as_str()) {
            return self;
        }
        self.tags.insert(key, value.into());
        self
    }

    /// Attach a mutation for the metric `name`, replacing any earlier one.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, mutation: MetricMutation) -> Self {
        self.metrics
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), mutation);
        self
    }

    /// The originating resource instance.
    #[must_use]
    pub fn resource(&self) -> ResourceKey {
        let kind = self.tags.get(SRC_TAG).map_or(UNKNOWN, String::as_str);
        let instance = self.tags.get(kind).map_or(UNKNOWN, String::as_str);
        ResourceKey::new(kind, instance)
    }

    /// Encode as a `LOG` Event.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not fit in an envelope.
    pub fn to_event(&self) -> Result<Event, EventError> {
        Event::from_payload(EventId::new(), EventType::LOG, self)
    }

    /// Decode from a `LOG` Event.
    ///
    /// # Errors
    ///
    /// Returns an error on a tag mismatch or a malformed payload.
    pub fn from_event(event: &Event) -> Result<Self, EventError> {
        event.payload_as(EventType::LOG)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.level, self.resource(), self.code)?;
        if let Some(data) = &self.data {
            write!(f, " {data}")?;
        }
        Ok(())
    }
}
