//! Fatal errors carried by `CRA` events.

use crate::error::EventError;
use crate::event::Event;
use crate::types::{EventId, EventType, Timestamp};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// An error flattened for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    /// Error class name.
    pub name: String,
    pub message: String,
    /// Source chain or backtrace, one cause per line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Arbitrary error code, e.g. an exit status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
}

/// A captured fatal error. Receiving one tears the process tree down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crash {
    pub id: EventId,
    pub error: SerializedError,
}

impl Crash {
    /// Create a crash with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            error: SerializedError {
                name: name.into(),
                message: message.into(),
                stack: None,
                code: None,
            },
        }
    }

    /// Capture an error together with its source chain.
    #[must_use]
    pub fn from_error(name: impl Into<String>, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        let crash = Self::new(name, error.to_string());
        if causes.is_empty() {
            crash
        } else {
            crash.with_stack(causes.join("\n"))
        }
    }

    /// Capture a panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        Self::new("Panic", message)
    }

    /// The worker exited without reporting a crash first. `code` is the
    /// exit status when the process ended normally.
    #[must_use]
    pub fn unexpected_exit(code: Option<i32>) -> Self {
        match code {
            Some(code) => Self::new(
                "UnexpectedExit",
                format!("worker exited unexpectedly with status {code}"),
            )
            .with_code(code.into()),
            None => Self::new("UnexpectedExit", "worker exited unexpectedly"),
        }
    }

    /// The worker kept emitting frames that could not be decoded.
    #[must_use]
    pub fn malformed_stream(consecutive: usize) -> Self {
        Self::new(
            "MalformedStream",
            format!("{consecutive} consecutive frames failed to decode"),
        )
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.error.stack = Some(stack.into());
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: serde_json::Value) -> Self {
        self.error.code = Some(code);
        self
    }

    /// When the crash was captured, recovered from its id.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.id.timestamp()
    }

    /// Encode as a `CRA` Event sharing the crash id.
    ///
    /// # Errors
    ///
    /// Returns an error if the crash does not fit in an envelope.
    pub fn to_event(&self) -> Result<Event, EventError> {
        Event::from_payload(self.id, EventType::CRASH, self)
    }

    /// Decode from a `CRA` Event.
    ///
    /// # Errors
    ///
    /// Returns an error on a tag mismatch or a malformed payload.
    pub fn from_event(event: &Event) -> Result<Self, EventError> {
        event.payload_as(EventType::CRASH)
    }
}

impl fmt::Display for Crash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error.name, self.error.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "could not load module")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn from_error_records_source_chain() {
        let err = Outer(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"));
        let crash = Crash::from_error("LoadError", &err);
        assert_eq!(crash.error.message, "could not load module");
        assert_eq!(crash.error.stack.as_deref(), Some("caused by: no such file"));
        assert_eq!(crash.to_string(), "LoadError: could not load module");
    }

    #[test]
    fn from_panic_reads_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(Crash::from_panic(payload.as_ref()).error.message, "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(Crash::from_panic(payload.as_ref()).error.message, "bang");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert!(Crash::from_panic(payload.as_ref()).error.message.contains("non-string"));
    }

    #[test]
    fn unexpected_exit_carries_status() {
        let crash = Crash::unexpected_exit(Some(3));
        assert_eq!(crash.error.code, Some(serde_json::json!(3)));
        assert!(crash.error.message.contains("status 3"));
        assert!(Crash::unexpected_exit(None).error.code.is_none());
    }

    #[test]
    fn event_shares_the_crash_id() -> Result<(), Box<dyn std::error::Error>> {
        let crash = Crash::new("Fatal", "oops").with_code(serde_json::json!("E_FATAL"));
        let event = crash.to_event()?;
        assert_eq!(event.id(), crash.id);
        assert_eq!(event.kind(), EventType::CRASH);
        assert_eq!(Crash::from_event(&Event::decode(&event.encode())?)?, crash);
        assert_eq!(crash.timestamp(), event.timestamp());
        Ok(())
    }
}
