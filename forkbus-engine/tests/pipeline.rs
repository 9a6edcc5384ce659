//! End-to-end tests: a real worker runtime over in-memory pipes, supervised
//! by a real Supervisor.

use forkbus_client::frame::{read_frame, write_frame, ReadFrame};
use forkbus_client::prelude::*;
use forkbus_client::{run_worker_with_io, ResourceKey, TopicEvent, WorkerError, WorkerResult};
use forkbus_engine::{LogStore, MetricFrame, Supervisor, SupervisorOptions, SupervisorState, WorkerIo};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{duplex, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn options(max_decode_failures: usize) -> SupervisorOptions {
    SupervisorOptions {
        name: "test".to_string(),
        max_decode_failures,
    }
}

/// Run `body` as a worker and supervise it.
fn start<F, Fut>(store: Arc<LogStore>, body: F) -> (Supervisor, JoinHandle<WorkerResult<()>>)
where
    F: FnOnce(WorkerContext, ShutdownReceiver) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let (worker_in, parent_out) = duplex(64 * 1024);
    let (parent_in, worker_out) = duplex(64 * 1024);
    let worker = tokio::spawn(run_worker_with_io("w", Vec::new(), worker_in, worker_out, body));
    let supervisor = Supervisor::attach(WorkerIo::new(parent_in, parent_out), options(16), store);
    (supervisor, worker)
}

/// Write a length-prefixed body that is not a valid envelope.
async fn write_raw_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(u32::try_from(body.len()).unwrap_or(u32::MAX)).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Supervise a raw channel the test writes frames into.
fn start_raw(max_decode_failures: usize) -> (Supervisor, DuplexStream, DuplexStream) {
    let (worker_out, parent_in) = duplex(64 * 1024);
    let (parent_out, worker_in) = duplex(64 * 1024);
    let supervisor = Supervisor::attach(
        WorkerIo::new(parent_in, parent_out),
        options(max_decode_failures),
        Arc::new(LogStore::new(100)),
    );
    (supervisor, worker_out, worker_in)
}

async fn wait_for_shutdown(mut shutdown: ShutdownReceiver) -> Result<(), BoxError> {
    while !*shutdown.borrow() {
        shutdown.changed().await?;
    }
    Ok(())
}

#[tokio::test]
async fn logs_reach_the_stream_and_the_store() -> TestResult {
    let store = Arc::new(LogStore::new(100));
    let (supervisor, worker) = start(Arc::clone(&store), |ctx, shutdown| async move {
        let log = ctx.logger("counter", "c1");
        let first: MetricMutation = serde_json::from_value(json!({"upsert": [{"id": "1", "v": 1}]}))?;
        let second: MetricMutation = serde_json::from_value(json!({"patch": [{"id": "1", "v": 2}]}))?;
        log.info("STARTED").metric("ticks", first).emit();
        log.debug("TRACE").emit();
        log.info("DONE").metric("ticks", second).emit();
        wait_for_shutdown(shutdown).await
    });
    let mut logs = supervisor.logs();

    let mut codes = Vec::new();
    for _ in 0..3 {
        codes.push(logs.next().await.ok_or("log stream ended early")?.code);
    }
    assert_eq!(codes, vec!["STARTED", "TRACE", "DONE"]);
    assert_eq!(supervisor.state(), SupervisorState::Running);

    let stored: Vec<String> = store.get_all_logs().into_iter().map(|r| r.code).collect();
    assert_eq!(stored, vec!["STARTED", "DONE"]);

    let snapshot = store
        .metric_snapshot("ticks", &ResourceKey::new("counter", "c1"))
        .ok_or("no metric snapshot")?;
    assert_eq!(serde_json::to_value(&snapshot)?, json!([{"id": "1", "v": 2}]));

    let mut frames = store.get_metrics("ticks");
    let first = frames.next().await.ok_or("no metric frame")?;
    assert!(matches!(first, MetricFrame::Snapshot { ref records, .. } if records.len() == 1));

    assert_eq!(supervisor.stop().await, SupervisorState::Stopped);
    assert!(logs.next().await.is_none());
    assert!(frames.next().await.is_none());
    worker.await??;
    Ok(())
}

#[tokio::test]
async fn topic_values_cross_the_process_boundary() -> TestResult {
    let store = Arc::new(LogStore::new(100));
    let (supervisor, worker) = start(store, |ctx, shutdown| async move {
        let doubled = ctx.bus().topic("doubled", Schema::<u64>::new());
        let mut requests = ctx.bus().topic("requests", Schema::<u64>::new()).subscribe();
        ctx.logger("echo", "e1").info("READY").emit();

        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                value = requests.next() => match value {
                    Some(n) => { doubled.publish(&(n * 2)); }
                    None => break,
                },
            }
        }
        Ok::<(), BoxError>(())
    });

    let mut logs = supervisor.logs();
    let mut replies = supervisor.bus().topic("doubled", Schema::<u64>::new()).subscribe();

    let ready = logs.next().await.ok_or("worker never became ready")?;
    assert_eq!(ready.code, "READY");

    assert!(supervisor.bus().topic("requests", Schema::<u64>::new()).publish(&21));
    assert_eq!(replies.next().await, Some(42));

    assert_eq!(supervisor.stop().await, SupervisorState::Stopped);
    assert!(replies.next().await.is_none());
    worker.await??;
    Ok(())
}

#[tokio::test]
async fn worker_crash_is_terminal() -> TestResult {
    let store = Arc::new(LogStore::new(100));
    let (supervisor, worker) = start(Arc::clone(&store), |ctx, _| async move {
        ctx.logger("loader", "l1").error("LOAD_FAILED").emit();
        Err::<(), BoxError>("module not found".into())
    });
    let mut crashes = supervisor.crashes();

    let state = supervisor.wait().await;
    let crash = state.crash().ok_or("expected a crash")?;
    assert_eq!(crash.error.message, "module not found");
    assert_eq!(crashes.next().await.as_ref(), Some(crash));
    assert!(crashes.next().await.is_none());

    let mut late = supervisor.crashes();
    assert_eq!(late.next().await.as_ref(), Some(crash));
    assert!(late.next().await.is_none());

    assert!(supervisor.logs().next().await.is_none());
    let mut topic = supervisor.bus().topic("anything", Schema::<u64>::new()).subscribe();
    assert!(topic.next().await.is_none());

    let stored: Vec<String> = store.get_all_logs().into_iter().map(|r| r.code).collect();
    assert_eq!(stored, vec!["LOAD_FAILED"]);

    assert!(matches!(worker.await?, Err(WorkerError::Crashed(_))));
    assert_eq!(supervisor.stop().await, state);
    Ok(())
}

#[tokio::test]
async fn worker_exit_without_crash_is_unexpected() -> TestResult {
    let store = Arc::new(LogStore::new(100));
    let (supervisor, worker) = start(store, |_, _| async move { Ok::<(), BoxError>(()) });

    let state = supervisor.wait().await;
    let crash = state.crash().ok_or("expected a crash")?;
    assert_eq!(crash.error.name, "UnexpectedExit");
    worker.await??;
    Ok(())
}

#[tokio::test]
async fn malformed_frames_crash_only_past_the_threshold() -> TestResult {
    let (supervisor, mut worker_out, _worker_in) = start_raw(3);
    let mut logs = supervisor.logs();

    write_raw_frame(&mut worker_out, b"noise").await?;
    write_raw_frame(&mut worker_out, b"more noise").await?;
    let first = LogRecord::new(LogLevel::Inf, "A", "w", "1");
    write_frame(&mut worker_out, &first.to_event()?).await?;
    write_raw_frame(&mut worker_out, b"noise").await?;
    write_raw_frame(&mut worker_out, b"noise").await?;
    let second = LogRecord::new(LogLevel::Inf, "B", "w", "1");
    write_frame(&mut worker_out, &second.to_event()?).await?;

    assert_eq!(logs.next().await.map(|r| r.code), Some("A".to_string()));
    assert_eq!(logs.next().await.map(|r| r.code), Some("B".to_string()));
    assert_eq!(supervisor.state(), SupervisorState::Running);

    for _ in 0..3 {
        write_raw_frame(&mut worker_out, b"garbage").await?;
    }
    let state = supervisor.wait().await;
    let crash = state.crash().ok_or("expected a crash")?;
    assert_eq!(crash.error.name, "MalformedStream");
    assert!(logs.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn stop_tears_down_the_channel() -> TestResult {
    let (supervisor, _worker_out, mut worker_in) = start_raw(16);
    let mut logs = supervisor.logs();
    let mut crashes = supervisor.crashes();

    assert_eq!(supervisor.stop().await, SupervisorState::Stopped);
    assert!(logs.next().await.is_none());
    assert!(crashes.next().await.is_none());
    assert!(matches!(read_frame(&mut worker_in).await?, ReadFrame::Closed));
    Ok(())
}

#[tokio::test]
async fn parent_publish_reaches_a_subscribed_worker() -> TestResult {
    let (supervisor, mut worker_out, mut worker_in) = start_raw(16);

    write_frame(&mut worker_out, &TopicEvent::on("jobs", None).to_event()?).await?;
    // Anything after the ON proves the router has seen it.
    let mut logs = supervisor.logs();
    let marker = LogRecord::new(LogLevel::Inf, "SUBSCRIBED", "w", "1");
    write_frame(&mut worker_out, &marker.to_event()?).await?;
    assert_eq!(logs.next().await.map(|r| r.code), Some("SUBSCRIBED".to_string()));

    assert!(supervisor.bus().topic("jobs", Schema::<String>::new()).publish(&"build".to_string()));

    let ReadFrame::Event(event) = read_frame(&mut worker_in).await? else {
        panic!("expected a topic frame");
    };
    assert_eq!(
        TopicEvent::from_event(&event)?,
        TopicEvent::inbound("jobs", json!("build"))
    );
    Ok(())
}
