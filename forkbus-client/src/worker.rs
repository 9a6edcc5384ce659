//! Worker-side runtime.
//!
//! [`run_worker`] removes the boilerplate of a forked worker: it wires the
//! framed stdin/stdout channel to the supervisor, creates the worker's
//! [`Bus`], installs signal handling and turns a failing body into a
//! `CRA` event. Developers only provide the resource logic as an async
//! closure.
//!
//! # Example
//!
//! ```rust,ignore
//! use forkbus_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     run_worker(Some("ticker"), |ctx, mut shutdown| async move {
//!         let log = ctx.logger("ticker", "t1");
//!         let ticks = ctx.bus().topic("ticks", Schema::<u64>::new());
//!         let mut interval = tokio::time::interval(Duration::from_secs(1));
//!         let mut n = 0;
//!
//!         loop {
//!             tokio::select! {
//!                 _ = shutdown.changed() => break,
//!                 _ = interval.tick() => {
//!                     n += 1;
//!                     ticks.publish(&n);
//!                     log.debug("TICK").data(json!({"n": n})).emit();
//!                 }
//!             }
//!         }
//!         Ok(())
//!     }).await?;
//!     Ok(())
//! }
//! ```

use crate::bus::Bus;
use crate::crash::Crash;
use crate::error::{WorkerError, WorkerResult};
use crate::event::Event;
use crate::fanout::Fanout;
use crate::frame::{read_frame, write_frame, ReadFrame};
use crate::log::LogRecord;
use crate::logger::Logger;
use crate::stream::EventStream;
use crate::topic::{TopicEvent, TopicSignal};
use crate::types::EventType;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

/// Environment variable carrying the worker name.
pub const NAME_ENV: &str = "FORKBUS_NAME";

const DEFAULT_NAME: &str = "worker";

/// Error type a worker body may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shutdown signal receiver type.
///
/// Becomes `true` on SIGINT, SIGTERM or when the supervisor closes the
/// worker's input. Call `.changed().await` to wait for it.
pub type ShutdownReceiver = watch::Receiver<bool>;

/// Resolve the worker name from the explicit option, the environment, or
/// the default.
fn resolve_name(name: Option<&str>, from_env: Option<String>) -> String {
    name.map(ToString::to_string)
        .or(from_env)
        .unwrap_or_else(|| DEFAULT_NAME.to_string())
}

enum WriterCommand {
    Event(Event),
    Flush(oneshot::Sender<()>),
}

/// Queue of events bound for the supervisor.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl Outbound {
    fn send(&self, event: Event) {
        if self.tx.send(WriterCommand::Event(event)).is_err() {
            debug!("output closed, dropping event");
        }
    }

    /// Wait until everything queued so far has been written.
    async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// What a worker body gets to work with.
#[derive(Clone)]
pub struct WorkerContext {
    name: String,
    modules: Vec<String>,
    bus: Bus,
    logs: Arc<Mutex<Fanout<LogRecord>>>,
    outbound: Outbound,
}

impl WorkerContext {
    /// The worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module locators the worker was started with.
    #[must_use]
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// The worker's bus. Its topics are mirrored to the supervisor.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// A logger for the resource `src`/`instance`.
    ///
    /// Records reach [`local_logs`](Self::local_logs) subscribers (debug
    /// included) and are written to the supervisor.
    pub fn logger(&self, src: impl Into<String>, instance: impl Into<String>) -> Logger {
        let logs = Arc::clone(&self.logs);
        let outbound = self.outbound.clone();
        Logger::new(src, instance, move |record: &LogRecord| {
            logs.lock().unwrap_or_else(PoisonError::into_inner).send(record);
            match record.to_event() {
                Ok(event) => outbound.send(event),
                Err(e) => warn!(code = %record.code, error = %e, "dropping log record"),
            }
        })
    }

    /// Live log records emitted inside this worker.
    pub fn local_logs(&self) -> EventStream<LogRecord> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe()
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("name", &self.name)
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}

/// Run a worker on the process's stdin/stdout.
///
/// This function handles all the boilerplate for running a worker:
/// - Resolves the name from the provided option, `FORKBUS_NAME` env var,
///   or the default `"worker"`
/// - Takes the module locators from the command-line arguments
/// - Sets up SIGINT/SIGTERM handling for graceful shutdown
/// - Calls your function with a [`WorkerContext`] and a shutdown receiver
/// - Reports an error or panic from your function as a crash
///
/// # Errors
///
/// Returns [`WorkerError::Crashed`] if the body failed; the crash has been
/// written to the supervisor by then. Returns
/// [`WorkerError::SignalHandlerFailed`] if signal handling cannot be set up.
pub async fn run_worker<F, Fut>(name: Option<&str>, run_fn: F) -> WorkerResult<()>
where
    F: FnOnce(WorkerContext, ShutdownReceiver) -> Fut,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let name = resolve_name(name, std::env::var(NAME_ENV).ok());
    let modules: Vec<String> = std::env::args().skip(1).collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| WorkerError::SignalHandlerFailed(e.to_string()))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| WorkerError::SignalHandlerFailed(e.to_string()))?;

    let signal_task = tokio::spawn({
        let shutdown_tx = Arc::clone(&shutdown_tx);
        async move {
            tokio::select! {
                _ = sigterm.recv() => debug!("received SIGTERM"),
                _ = sigint.recv() => debug!("received SIGINT"),
            }
            let _ = shutdown_tx.send(true);
        }
    });

    let result = serve(
        name,
        modules,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_tx,
        shutdown_rx,
        run_fn,
    )
    .await;

    signal_task.abort();
    result
}

/// Run a worker over arbitrary byte streams.
///
/// Same as [`run_worker`] without signal handling: shutdown is requested
/// only when `reader` reaches end of stream.
///
/// # Errors
///
/// Returns [`WorkerError::Crashed`] if the body failed.
pub async fn run_worker_with_io<R, W, F, Fut>(
    name: impl Into<String>,
    modules: Vec<String>,
    reader: R,
    writer: W,
    run_fn: F,
) -> WorkerResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(WorkerContext, ShutdownReceiver) -> Fut,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    serve(
        name.into(),
        modules,
        reader,
        writer,
        Arc::new(shutdown_tx),
        shutdown_rx,
        run_fn,
    )
    .await
}

async fn serve<R, W, F, Fut>(
    name: String,
    modules: Vec<String>,
    reader: R,
    writer: W,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: ShutdownReceiver,
    run_fn: F,
) -> WorkerResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(WorkerContext, ShutdownReceiver) -> Fut,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let outbound = Outbound { tx: out_tx };
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let bus = Bus::new({
        let outbound = outbound.clone();
        move |signal: TopicEvent| match signal.to_event() {
            Ok(event) => outbound.send(event),
            Err(e) => warn!(topic = %signal.sub(), error = %e, "dropping topic signal"),
        }
    });
    let reader_task = tokio::spawn(read_loop(reader, bus.clone(), shutdown_tx));

    let ctx = WorkerContext {
        name: name.clone(),
        modules,
        bus: bus.clone(),
        logs: Arc::new(Mutex::new(Fanout::new())),
        outbound: outbound.clone(),
    };
    debug!(worker = %name, modules = ?ctx.modules, "starting worker body");

    let outcome = tokio::spawn(run_fn(ctx, shutdown_rx)).await;
    reader_task.abort();
    bus.close();

    let crash = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(Crash::from_error("WorkerError", e.as_ref())),
        Err(join) if join.is_panic() => Some(Crash::from_panic(join.into_panic().as_ref())),
        Err(join) => Some(Crash::new("Cancelled", join.to_string())),
    };

    if let Some(crash) = &crash {
        error!(worker = %name, %crash, "worker body failed");
        match crash.to_event() {
            Ok(event) => outbound.send(event),
            Err(e) => error!(error = %e, "crash could not be encoded"),
        }
    }

    outbound.flush().await;
    writer_task.abort();

    match crash {
        Some(crash) => Err(WorkerError::Crashed(Box::new(crash))),
        None => {
            debug!(worker = %name, "worker stopped");
            Ok(())
        }
    }
}

/// Deliver inbound topic values to the bus until the supervisor goes away.
async fn read_loop<R>(mut reader: R, bus: Bus, shutdown_tx: Arc<watch::Sender<bool>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(ReadFrame::Event(event)) if event.kind() == EventType::TOPIC => {
                match TopicEvent::from_event(&event) {
                    Ok(topic) if topic.signal() == TopicSignal::In => {
                        let reached = bus.deliver(&topic);
                        debug!(topic = %topic.sub(), reached, "delivered inbound value");
                    }
                    Ok(topic) => {
                        warn!(topic = %topic.sub(), signal = %topic.signal(), "ignoring non-IN signal from supervisor");
                    }
                    Err(e) => warn!(error = %e, "skipping undecodable topic event"),
                }
            }
            Ok(ReadFrame::Event(event)) => {
                warn!(kind = %event.kind(), "ignoring unexpected event from supervisor");
            }
            Ok(ReadFrame::Malformed(e)) => warn!(error = %e, "skipping malformed frame"),
            Ok(ReadFrame::Closed) => {
                debug!("input closed by supervisor");
                break;
            }
            Err(e) => {
                warn!(error = %e, "input read failed");
                break;
            }
        }
    }
    let _ = shutdown_tx.send(true);
}

/// Write queued events in order.
async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<WriterCommand>)
where
    W: AsyncWrite + Unpin,
{
    let mut broken = false;
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Event(event) if !broken => {
                if let Err(e) = write_frame(&mut writer, &event).await {
                    warn!(error = %e, "output write failed, discarding further events");
                    broken = true;
                }
            }
            WriterCommand::Event(_) => {}
            WriterCommand::Flush(done) => {
                if !broken {
                    let _ = writer.flush().await;
                }
                let _ = done.send(());
            }
        }
    }
}
