//! Core value types shared by the envelope, the bus and the stores.
//!
//! - [`EventId`] - time-ordered 128-bit identifier (UUIDv7)
//! - [`EventType`] - validated three-letter tag (`LOG`, `CRA`, `TOP`, ...)
//! - [`Timestamp`] - milliseconds since Unix epoch
//!
//! # Example
//!
//! ```rust
//! use forkbus_client::types::{EventId, EventType};
//!
//! let id = EventId::new();
//! let tag = EventType::new("LOG").expect("valid tag");
//!
//! assert_eq!(tag, EventType::LOG);
//! assert!(id.timestamp().as_millis() > 0);
//! ```

mod event_id;
mod event_type;
mod timestamp;

pub use event_id::{EventId, InvalidEventId};
pub use event_type::{EventType, InvalidEventType};
pub use timestamp::Timestamp;
