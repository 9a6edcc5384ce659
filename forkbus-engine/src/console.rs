//! Console rendering of worker log records.
//!
//! Records are re-emitted as `tracing` events at the matching level under
//! the `worker` target, so `RUST_LOG=worker=debug` shows worker debug
//! output without raising the engine's own verbosity.

use forkbus_client::{LogLevel, LogRecord};
use futures::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

/// Emit one record through `tracing`.
pub fn render(record: &LogRecord) {
    let resource = record.resource();
    let data = record
        .data
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    let metrics = record.metrics.as_ref().map_or(0, |m| m.len());

    match record.level {
        LogLevel::Dbg => debug!(target: "worker", %resource, metrics, "{} {}", record.code, data),
        LogLevel::Inf => info!(target: "worker", %resource, metrics, "{} {}", record.code, data),
        LogLevel::War => warn!(target: "worker", %resource, metrics, "{} {}", record.code, data),
        LogLevel::Err => error!(target: "worker", %resource, metrics, "{} {}", record.code, data),
    }
}

/// Render every record of `logs` until the stream ends.
///
/// Works with the supervisor's live logs as well as the store's
/// replay-then-tail stream. Returns the number of records rendered.
pub async fn run<S>(mut logs: S) -> usize
where
    S: Stream<Item = LogRecord> + Unpin,
{
    let mut rendered = 0;
    while let Some(record) = logs.next().await {
        render(&record);
        rendered += 1;
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkbus_client::Fanout;

    #[tokio::test]
    async fn renders_until_the_stream_ends() {
        let mut fanout = Fanout::new();
        let stream = fanout.subscribe();
        fanout.send(&LogRecord::new(LogLevel::Inf, "UP", "svc", "a"));
        fanout.send(&LogRecord::new(LogLevel::Dbg, "TICK", "svc", "a").with_data(serde_json::json!({"n": 1})));
        fanout.close();

        assert_eq!(run(stream).await, 2);
    }
}
