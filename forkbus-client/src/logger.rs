//! Per-resource log handle.

use crate::fanout::Fanout;
use crate::log::{LogLevel, LogRecord};
use crate::metric::MetricMutation;
use crate::stream::EventStream;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

type EmitFn = dyn Fn(&LogRecord) + Send + Sync;

/// Emits [`LogRecord`]s tagged with one resource's kind and instance.
///
/// Cheap to clone. Inside a worker, obtain one from
/// [`WorkerContext::logger`](crate::WorkerContext::logger); records then
/// reach local log subscribers and the supervisor.
///
/// ```rust,ignore
/// let log = ctx.logger("counter", "c1");
/// log.info("TICK")
///     .data(json!({"n": n}))
///     .metric("ticks", MetricMutation::upsert([record]))
///     .emit();
/// ```
#[derive(Clone)]
pub struct Logger {
    src: String,
    instance: String,
    emit: Arc<EmitFn>,
}

impl Logger {
    /// A logger handing every record to `emit`.
    pub fn new<F>(src: impl Into<String>, instance: impl Into<String>, emit: F) -> Self
    where
        F: Fn(&LogRecord) + Send + Sync + 'static,
    {
        Self {
            src: src.into(),
            instance: instance.into(),
            emit: Arc::new(emit),
        }
    }

    /// A logger whose records are queued on a stream.
    #[must_use]
    pub fn channel(
        src: impl Into<String>,
        instance: impl Into<String>,
    ) -> (Self, EventStream<LogRecord>) {
        let fanout = Arc::new(Mutex::new(Fanout::new()));
        let stream = fanout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();
        let logger = Self::new(src, instance, move |record: &LogRecord| {
            fanout
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send(record);
        });
        (logger, stream)
    }

    #[must_use]
    pub fn src(&self) -> &str {
        &self.src
    }

    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn debug(&self, code: impl Into<String>) -> LogBuilder<'_> {
        self.build(LogLevel::Dbg, code)
    }

    pub fn info(&self, code: impl Into<String>) -> LogBuilder<'_> {
        self.build(LogLevel::Inf, code)
    }

    pub fn warn(&self, code: impl Into<String>) -> LogBuilder<'_> {
        self.build(LogLevel::War, code)
    }

    pub fn error(&self, code: impl Into<String>) -> LogBuilder<'_> {
        self.build(LogLevel::Err, code)
    }

    /// Emit a prebuilt record as is.
    pub fn log(&self, record: &LogRecord) {
        (self.emit)(record);
    }

    fn build(&self, level: LogLevel, code: impl Into<String>) -> LogBuilder<'_> {
        LogBuilder {
            logger: self,
            record: LogRecord::new(level, code, self.src.clone(), self.instance.clone()),
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("src", &self.src)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

/// A record under construction. Nothing is emitted until [`emit`](Self::emit).
#[must_use = "log records are only emitted by calling `emit`"]
#[derive(Debug)]
pub struct LogBuilder<'a> {
    logger: &'a Logger,
    record: LogRecord,
}

impl LogBuilder<'_> {
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.record = self.record.with_data(data);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.record = self.record.with_tag(key, value);
        self
    }

    pub fn metric(mut self, name: impl Into<String>, mutation: MetricMutation) -> Self {
        self.record = self.record.with_metric(name, mutation);
        self
    }

    /// Emit the record.
    pub fn emit(self) {
        self.logger.log(&self.record);
    }

    /// The record built so far.
    #[must_use]
    pub fn into_record(self) -> LogRecord {
        self.record
    }
}
