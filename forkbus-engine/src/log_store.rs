//! Log and metric store with replay for late observers.
//!
//! The store is the single place that retains history:
//!
//! - a bounded ring of non-debug [`LogRecord`]s, oldest evicted first;
//! - per metric name and per resource instance, the collection obtained by
//!   folding every record's metric mutations in emission order.
//!
//! [`LogStore::get_logs`] replays the ring and then tails live records;
//! [`LogStore::get_metrics`] yields the current folded snapshot and then
//! live mutations. Both attach under the same lock that ingestion holds,
//! so an observer never sees a gap or a duplicate at the seam.
//!
//! Debug records are neither ringed, folded nor persisted. Crashes are not
//! stored at all.

use crate::sink::LogSink;
use forkbus_client::metric::{apply_in_place, MetricMutation, Record};
use forkbus_client::{EventStream, Fanout, LogRecord, ResourceKey};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// One item of a metric stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricFrame {
    /// Folded state of one resource's collection at attach time.
    Snapshot {
        resource: ResourceKey,
        records: Vec<Record>,
    },
    /// A mutation applied after the snapshot.
    Delta {
        resource: ResourceKey,
        mutation: MetricMutation,
    },
}

impl MetricFrame {
    #[must_use]
    pub fn resource(&self) -> &ResourceKey {
        match self {
            Self::Snapshot { resource, .. } | Self::Delta { resource, .. } => resource,
        }
    }
}

struct StoreState {
    capacity: usize,
    ring: VecDeque<LogRecord>,
    /// metric name -> resource -> folded records
    metrics: HashMap<String, BTreeMap<ResourceKey, Vec<Record>>>,
    log_observers: Fanout<LogRecord>,
    metric_observers: HashMap<String, Fanout<MetricFrame>>,
    closed: bool,
}

/// In-memory log ring and metric fold state.
pub struct LogStore {
    state: Mutex<StoreState>,
    sink: Option<Box<dyn LogSink>>,
}

impl LogStore {
    /// Create a store keeping at most `capacity` records (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(StoreState {
                capacity,
                ring: VecDeque::with_capacity(capacity.min(1024)),
                metrics: HashMap::new(),
                log_observers: Fanout::new(),
                metric_observers: HashMap::new(),
                closed: false,
            }),
            sink: None,
        }
    }

    /// Also persist every stored record to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a record and fold its metrics.
    ///
    /// Returns `false` for debug records, which are not stored.
    pub fn ingest(&self, record: &LogRecord) -> bool {
        if record.level.is_debug() {
            return false;
        }

        {
            let mut state = self.state();
            if state.ring.len() == state.capacity {
                state.ring.pop_front();
            }
            state.ring.push_back(record.clone());

            if let Some(metrics) = &record.metrics {
                let resource = record.resource();
                for (name, mutation) in metrics {
                    let records = state
                        .metrics
                        .entry(name.clone())
                        .or_default()
                        .entry(resource.clone())
                        .or_default();
                    apply_in_place(records, mutation);

                    if let Some(observers) = state.metric_observers.get_mut(name) {
                        observers.send(&MetricFrame::Delta {
                            resource: resource.clone(),
                            mutation: mutation.clone(),
                        });
                    }
                }
            }

            state.log_observers.send(record);
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(record) {
                warn!(code = %record.code, error = %e, "failed to persist log record");
            }
        }
        true
    }

    /// Replay the ring, then follow live records.
    pub fn get_logs(&self) -> EventStream<LogRecord> {
        let mut state = self.state();
        let backlog: Vec<LogRecord> = state.ring.iter().cloned().collect();
        state.log_observers.subscribe_with(backlog)
    }

    /// The ring contents, oldest first.
    #[must_use]
    pub fn get_all_logs(&self) -> Vec<LogRecord> {
        self.state().ring.iter().cloned().collect()
    }

    /// Current snapshot per resource for `name`, then live mutations.
    ///
    /// Snapshots are yielded in resource order. A metric nobody has
    /// written yet starts with no snapshot frames.
    pub fn get_metrics(&self, name: &str) -> EventStream<MetricFrame> {
        let mut state = self.state();
        let snapshots: Vec<MetricFrame> = state
            .metrics
            .get(name)
            .map(|per_resource| {
                per_resource
                    .iter()
                    .map(|(resource, records)| MetricFrame::Snapshot {
                        resource: resource.clone(),
                        records: records.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if state.closed {
            let mut ended = Fanout::new();
            ended.close();
            return ended.subscribe_with(snapshots);
        }
        // Viewers of metrics nobody writes would otherwise pile up here.
        state.metric_observers.retain(|_, observers| observers.prune() > 0);
        state
            .metric_observers
            .entry(name.to_string())
            .or_default()
            .subscribe_with(snapshots)
    }

    /// Folded records of `name` for one resource.
    #[must_use]
    pub fn metric_snapshot(&self, name: &str, resource: &ResourceKey) -> Option<Vec<Record>> {
        self.state()
            .metrics
            .get(name)
            .and_then(|per_resource| per_resource.get(resource))
            .cloned()
    }

    /// Names of every metric seen so far, sorted.
    #[must_use]
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().metrics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Flush the persistence sink, if any.
    pub fn flush(&self) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.flush() {
                warn!(error = %e, "failed to flush log sink");
            }
        }
    }

    /// Complete every observer stream. History stays readable.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.log_observers.close();
        for observers in state.metric_observers.values_mut() {
            observers.close();
        }
        debug!("log store closed");
    }
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("LogStore")
            .field("capacity", &state.capacity)
            .field("stored", &state.ring.len())
            .field("metrics", &state.metrics.len())
            .field("persistent", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::StoreError;
    use forkbus_client::LogLevel;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn record(level: LogLevel, code: &str) -> LogRecord {
        LogRecord::new(level, code, "counter", "c1")
    }

    fn mutation(value: Value) -> MetricMutation {
        serde_json::from_value(value).expect("valid mutation")
    }

    fn codes(records: &[LogRecord]) -> Vec<&str> {
        records.iter().map(|r| r.code.as_str()).collect()
    }

    #[tokio::test]
    async fn replay_then_tail_without_gap_or_duplicate() {
        let store = LogStore::new(3);
        for code in ["A", "B", "C", "D"] {
            store.ingest(&record(LogLevel::Inf, code));
        }

        let mut logs = store.get_logs();
        store.ingest(&record(LogLevel::Inf, "E"));
        store.ingest(&record(LogLevel::War, "F"));
        store.close();

        let mut seen = Vec::new();
        while let Some(r) = logs.next().await {
            seen.push(r);
        }
        assert_eq!(codes(&seen), vec!["B", "C", "D", "E", "F"]);
    }

    #[test]
    fn ring_evicts_oldest_first() {
        let store = LogStore::new(2);
        for code in ["A", "B", "C"] {
            store.ingest(&record(LogLevel::Inf, code));
        }
        assert_eq!(codes(&store.get_all_logs()), vec!["B", "C"]);
    }

    #[test]
    fn debug_records_are_not_stored() {
        let store = LogStore::new(10);
        let dbg = record(LogLevel::Dbg, "TRACE")
            .with_metric("foo", mutation(json!({"insert": [{"id": "x"}]})));
        assert!(!store.ingest(&dbg));
        assert!(store.get_all_logs().is_empty());
        assert!(store.metric_names().is_empty());
    }

    #[test]
    fn metrics_fold_in_emission_order() {
        let store = LogStore::new(10);
        store.ingest(
            &record(LogLevel::Inf, "X")
                .with_metric("foo", mutation(json!({"upsert": [{"id": "1", "v": 1}]}))),
        );
        store.ingest(
            &record(LogLevel::Inf, "Y")
                .with_metric("foo", mutation(json!({"patch": [{"id": "1", "v": 2}]}))),
        );

        let snapshot = store.metric_snapshot("foo", &ResourceKey::new("counter", "c1"));
        let expected = mutation(json!({"insert": [{"id": "1", "v": 2}]})).insert;
        assert_eq!(snapshot, Some(expected));
    }

    #[test]
    fn metrics_are_kept_per_resource() {
        let store = LogStore::new(10);
        let upsert = mutation(json!({"upsert": [{"id": "k", "n": 1}]}));
        store.ingest(&LogRecord::new(LogLevel::Inf, "X", "counter", "a").with_metric("m", upsert.clone()));
        store.ingest(&LogRecord::new(LogLevel::Inf, "X", "counter", "b").with_metric("m", upsert));
        store.ingest(
            &LogRecord::new(LogLevel::Inf, "X", "counter", "b")
                .with_metric("m", mutation(json!({"remove": ["k"]}))),
        );

        let a = store.metric_snapshot("m", &ResourceKey::new("counter", "a"));
        let b = store.metric_snapshot("m", &ResourceKey::new("counter", "b"));
        assert_eq!(a.map(|r| r.len()), Some(1));
        assert_eq!(b.map(|r| r.len()), Some(0));
    }

    #[tokio::test]
    async fn metric_stream_starts_with_snapshot_then_deltas() -> Result<(), Box<dyn std::error::Error>> {
        let store = LogStore::new(10);
        let first = mutation(json!({"upsert": [{"id": "1", "v": 1}]}));
        let second = mutation(json!({"patch": [{"id": "1", "v": 2}]}));
        let resource = ResourceKey::new("counter", "c1");

        store.ingest(&record(LogLevel::Inf, "X").with_metric("foo", first.clone()));
        store.ingest(&record(LogLevel::Inf, "X").with_metric("foo", first));

        let mut frames = store.get_metrics("foo");
        store.ingest(&record(LogLevel::Inf, "Y").with_metric("foo", second.clone()));
        store.ingest(&record(LogLevel::Inf, "Z").with_metric("other", second.clone()));

        let snapshot = frames.next().await.ok_or("no snapshot")?;
        let MetricFrame::Snapshot { resource: r, records } = snapshot else {
            panic!("expected a snapshot first");
        };
        assert_eq!(r, resource);
        assert_eq!(records.len(), 1);

        let delta = frames.next().await.ok_or("no delta")?;
        assert_eq!(
            delta,
            MetricFrame::Delta {
                resource,
                mutation: second
            }
        );
        assert!(frames.try_next().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_metric_has_no_snapshot() {
        let store = LogStore::new(10);
        let mut frames = store.get_metrics("nothing");
        store.close();
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_metric_viewers_are_forgotten() -> Result<(), Box<dyn std::error::Error>> {
        let store = LogStore::new(10);
        for i in 0..10_000 {
            drop(store.get_metrics(&format!("m{i}")));
        }
        let mut frames = store.get_metrics("live");
        {
            let state = store.state();
            assert_eq!(state.metric_observers.len(), 1);
            assert_eq!(state.metric_observers.get("live").map(Fanout::subscriber_count), Some(1));
        }

        let upsert = mutation(json!({"upsert": [{"id": "1"}]}));
        store.ingest(&record(LogLevel::Inf, "X").with_metric("live", upsert.clone()));
        let delta = frames.next().await.ok_or("no delta")?;
        assert_eq!(
            delta,
            MetricFrame::Delta {
                resource: ResourceKey::new("counter", "c1"),
                mutation: upsert
            }
        );
        Ok(())
    }

    #[derive(Default)]
    struct MemorySink {
        appended: Mutex<Vec<String>>,
    }

    impl LogSink for Arc<MemorySink> {
        fn append(&self, record: &LogRecord) -> Result<(), StoreError> {
            self.appended
                .lock()
                .map_err(|e| StoreError::LockPoisoned(e.to_string()))?
                .push(record.code.clone());
            Ok(())
        }

        fn flush(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn sink_receives_non_debug_records() -> Result<(), Box<dyn std::error::Error>> {
        let sink = Arc::new(MemorySink::default());
        let store = LogStore::new(10).with_sink(Arc::clone(&sink));

        store.ingest(&record(LogLevel::Dbg, "HIDDEN"));
        store.ingest(&record(LogLevel::Err, "SHOWN"));
        store.flush();

        let appended = sink.appended.lock().map_err(|e| e.to_string())?;
        assert_eq!(*appended, vec!["SHOWN".to_string()]);
        Ok(())
    }
}
