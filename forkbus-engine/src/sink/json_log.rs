//! JSON-lines log persistence.
//!
//! Appends one JSON object per record to a file named after the current
//! UTC date, so files rotate daily.

use super::{LogSink, StoreError};
use chrono::{DateTime, Utc};
use forkbus_client::LogRecord;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// One line of the log file.
#[derive(Serialize)]
struct LogLine<'a> {
    /// ISO 8601 timestamp of the record.
    timestamp: String,
    record: &'a LogRecord,
}

struct OpenFile {
    date: String,
    writer: BufWriter<File>,
}

/// Daily-rotated JSON-lines sink.
pub struct JsonLogSink {
    log_dir: PathBuf,
    current: Mutex<Option<OpenFile>>,
}

impl JsonLogSink {
    /// Create a sink writing below `log_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be created.
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Result<Self, StoreError> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)?;

        Ok(Self {
            log_dir,
            current: Mutex::new(None),
        })
    }

    /// Path of the file for `date` (`YYYY-MM-DD`).
    #[must_use]
    pub fn file_for(&self, date: &str) -> PathBuf {
        self.log_dir.join(format!("logs-{date}.jsonl"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<OpenFile>>, StoreError> {
        self.current
            .lock()
            .map_err(|e| StoreError::LockPoisoned(format!("log file lock: {e}")))
    }

    /// Get or open the file for the current date.
    fn writer_for_today<'a>(
        &self,
        current: &'a mut Option<OpenFile>,
    ) -> Result<&'a mut BufWriter<File>, StoreError> {
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let stale = current.as_ref().map_or(true, |open| open.date != today);
        if stale {
            if let Some(open) = current.as_mut() {
                open.writer.flush()?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_for(&today))?;
            *current = Some(OpenFile {
                date: today,
                writer: BufWriter::new(file),
            });
        }

        match current.as_mut() {
            Some(open) => Ok(&mut open.writer),
            None => Err(StoreError::Io(std::io::Error::other("log file not open"))),
        }
    }
}

impl LogSink for JsonLogSink {
    fn append(&self, record: &LogRecord) -> Result<(), StoreError> {
        let timestamp: DateTime<Utc> = DateTime::from_timestamp_millis(
            i64::try_from(record.time.as_millis()).unwrap_or(i64::MAX),
        )
        .unwrap_or_else(Utc::now);

        let line = LogLine {
            timestamp: timestamp.to_rfc3339(),
            record,
        };

        let mut current = self.lock()?;
        let writer = self.writer_for_today(&mut current)?;
        serde_json::to_writer(&mut *writer, &line)?;
        writeln!(writer)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut current = self.lock()?;
        if let Some(open) = current.as_mut() {
            open.writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for JsonLogSink {
    fn drop(&mut self) {
        let _ = LogSink::flush(self);
    }
}
