//! Persistence of log records.
//!
//! The log store keeps replay history in memory; a [`LogSink`] receives a
//! copy of every stored record for durable, human-readable output.

pub mod json_log;

pub use json_log::JsonLogSink;

use forkbus_client::LogRecord;
use thiserror::Error;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Trait for log persistence backends.
pub trait LogSink: Send + Sync {
    /// Append a record.
    fn append(&self, record: &LogRecord) -> Result<(), StoreError>;

    /// Flush any buffered data.
    fn flush(&self) -> Result<(), StoreError>;
}
