//! Process supervision for one forked worker.
//!
//! The [`Supervisor`] owns the worker's duplex byte channel exclusively.
//! A reader task turns the worker's output into frames; a single pump task
//! demultiplexes them by event type:
//!
//! - `LOG` goes to the [`LogStore`] and to live [`logs`](Supervisor::logs)
//!   subscribers;
//! - `CRA` is terminal and goes to [`crashes`](Supervisor::crashes);
//! - `TOP` feeds the [`TopicRouter`], which mirrors values between the
//!   worker and the supervisor's own [`Bus`].
//!
//! The pump handles one frame at a time, so the derived streams observe
//! events in the order the worker emitted them.
//!
//! # State machine
//!
//! ```text
//! Starting ──first valid frame──► Running
//!    │                              │
//!    ├──CRA / exit / bad frames─────┼──► Crashed   (worker gets SIGTERM)
//!    └──stop()──────────────────────┴──► Stopped   (worker gets SIGINT)
//! ```
//!
//! Both terminal states close the log stream, the parent bus and the
//! store's observer streams.

use crate::config::ForkbusConfig;
use crate::log_store::LogStore;
use crate::router::{Endpoint, TopicRouter};
use forkbus_client::frame::{read_frame, write_frame, ReadFrame};
use forkbus_client::types::EventType;
use forkbus_client::worker::NAME_ENV;
use forkbus_client::{Bus, Crash, Event, EventStream, Fanout, LogRecord, TopicEvent};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of a supervised worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorState {
    /// Channel open, no event consumed yet.
    Starting,
    /// At least one event consumed.
    Running,
    /// The worker crashed or exited on its own.
    Crashed(Box<Crash>),
    /// Stopped on request.
    Stopped,
}

impl SupervisorState {
    /// Whether no further transition can happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Crashed(_) | Self::Stopped)
    }

    /// The crash, for the `Crashed` state.
    #[must_use]
    pub fn crash(&self) -> Option<&Crash> {
        match self {
            Self::Crashed(crash) => Some(crash),
            _ => None,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Crashed(crash) => write!(f, "crashed ({crash})"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {0} was not captured")]
    MissingPipe(&'static str),
}

/// Tunables of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Name used in diagnostics.
    pub name: String,
    /// Consecutive malformed frames tolerated; `0` tolerates any number.
    pub max_decode_failures: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            max_decode_failures: 16,
        }
    }
}

impl From<&ForkbusConfig> for SupervisorOptions {
    fn from(config: &ForkbusConfig) -> Self {
        Self {
            name: config.engine.name.clone(),
            max_decode_failures: config.supervisor.max_decode_failures,
        }
    }
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit status; `None` when terminated by a signal.
    pub code: Option<i32>,
}

/// The byte channel to a worker, plus what is known about its process.
pub struct WorkerIo {
    /// The worker's output.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// The worker's input.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Resolves once the process has exited.
    pub exit: Option<oneshot::Receiver<ExitInfo>>,
    /// Process to signal on teardown.
    pub pid: Option<u32>,
}

impl WorkerIo {
    /// A channel with no process behind it.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            exit: None,
            pid: None,
        }
    }
}

impl fmt::Debug for WorkerIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerIo")
            .field("pid", &self.pid)
            .field("exit", &self.exit.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct CrashBoard {
    observers: Fanout<Crash>,
    last: Option<Crash>,
}

#[derive(Default)]
struct Shared {
    logs: Mutex<Fanout<LogRecord>>,
    crashes: Mutex<CrashBoard>,
}

/// How long a closed output waits for the process exit status.
const EXIT_GRACE: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum PumpCommand {
    Stop,
}

/// Supervises one worker.
///
/// Dropping the supervisor stops the worker.
pub struct Supervisor {
    name: String,
    pid: Option<u32>,
    bus: Bus,
    store: Arc<LogStore>,
    shared: Arc<Shared>,
    state: watch::Receiver<SupervisorState>,
    commands: mpsc::UnboundedSender<PumpCommand>,
}

impl Supervisor {
    /// Fork the configured worker and supervise it.
    ///
    /// The worker gets `args ++ modules` on its command line and the
    /// engine name in `FORKBUS_NAME`. Its stderr is inherited.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    pub fn spawn(config: &ForkbusConfig, store: Arc<LogStore>) -> Result<Self, SupervisorError> {
        let worker = &config.worker;
        let mut cmd = Command::new(&worker.path);
        cmd.args(worker.command_args())
            .envs(&worker.env)
            .env(NAME_ENV, &config.engine.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            path: worker.path.clone(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        info!(path = %worker.path.display(), ?pid, modules = ?worker.modules, "started worker");

        // The Child lives in the monitor task; only the pid is kept.
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    debug!(?pid, %status, "worker exited");
                    status.code()
                }
                Err(e) => {
                    error!(?pid, error = %e, "failed to wait for worker");
                    None
                }
            };
            let _ = exit_tx.send(ExitInfo { code });
        });

        let io = WorkerIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            exit: Some(exit_rx),
            pid,
        };
        Ok(Self::attach(io, SupervisorOptions::from(config), store))
    }

    /// Supervise an already established worker channel.
    ///
    /// Must be called within a Tokio runtime.
    pub fn attach(io: WorkerIo, options: SupervisorOptions, store: Arc<LogStore>) -> Self {
        let (bus, signals) = Bus::channel();
        let (state_tx, state_rx) = watch::channel(SupervisorState::Starting);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let reader = tokio::spawn(read_frames(io.reader, frame_tx));
        let pump = Pump {
            name: options.name.clone(),
            pid: io.pid,
            max_decode_failures: options.max_decode_failures,
            malformed: 0,
            router: TopicRouter::new(),
            bus: bus.clone(),
            writer: Some(io.writer),
            exit: io.exit,
            reader,
            store: Arc::clone(&store),
            shared: Arc::clone(&shared),
            state: state_tx,
        };
        tokio::spawn(pump.run(command_rx, signals, frame_rx));

        Self {
            name: options.name,
            pid: io.pid,
            bus,
            store,
            shared,
            state: state_rx,
            commands: command_tx,
        }
    }

    /// Live log records from the worker, debug included.
    ///
    /// Ends when the supervisor reaches a terminal state; a subscriber
    /// attaching after that gets an empty stream.
    pub fn logs(&self) -> EventStream<LogRecord> {
        lock(&self.shared.logs).subscribe()
    }

    /// The worker's crash, if any.
    ///
    /// Yields at most one crash, also to subscribers attaching after it
    /// happened, and ends once the supervisor is terminal.
    pub fn crashes(&self) -> EventStream<Crash> {
        let mut board = lock(&self.shared.crashes);
        let last: Vec<Crash> = board.last.iter().cloned().collect();
        board.observers.subscribe_with(last)
    }

    /// The parent-side bus mirrored with the worker's.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the supervisor is crashed or stopped.
    pub async fn wait(&self) -> SupervisorState {
        let mut state = self.state.clone();
        let terminal = match state.wait_for(SupervisorState::is_terminal).await {
            Ok(terminal) => (*terminal).clone(),
            Err(_) => self.state.borrow().clone(),
        };
        terminal
    }

    /// Interrupt the worker and wait for the terminal state.
    ///
    /// Returns the crash instead if the worker crashed first.
    pub async fn stop(&self) -> SupervisorState {
        if self.commands.send(PumpCommand::Stop).is_err() {
            debug!(worker = %self.name, "supervisor already finished");
        }
        self.wait().await
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Read frames until the worker's output closes.
async fn read_frames(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    frames: mpsc::UnboundedSender<ReadFrame>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "worker output read failed");
                ReadFrame::Closed
            }
        };
        let closed = matches!(frame, ReadFrame::Closed);
        if frames.send(frame).is_err() || closed {
            break;
        }
    }
}

struct Pump {
    name: String,
    pid: Option<u32>,
    max_decode_failures: usize,
    malformed: usize,
    router: TopicRouter,
    bus: Bus,
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    exit: Option<oneshot::Receiver<ExitInfo>>,
    reader: JoinHandle<()>,
    store: Arc<LogStore>,
    shared: Arc<Shared>,
    state: watch::Sender<SupervisorState>,
}

impl Pump {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PumpCommand>,
        mut signals: EventStream<TopicEvent>,
        mut frames: mpsc::UnboundedReceiver<ReadFrame>,
    ) {
        loop {
            tokio::select! {
                biased;

                // A dropped supervisor stops the worker too.
                command = commands.recv() => {
                    match command {
                        Some(PumpCommand::Stop) => info!(worker = %self.name, "stop requested"),
                        None => debug!(worker = %self.name, "supervisor dropped"),
                    }
                    self.stop();
                    break;
                }

                Some(signal) = signals.next() => {
                    self.dispatch(Endpoint::Parent, &signal).await;
                }

                frame = frames.recv() => {
                    let frame = frame.unwrap_or(ReadFrame::Closed);
                    if let Some(crash) = self.on_frame(frame).await {
                        self.crash(crash);
                        break;
                    }
                }
            }
        }
        self.reader.abort();
    }

    async fn on_frame(&mut self, frame: ReadFrame) -> Option<Crash> {
        match frame {
            ReadFrame::Event(event) => self.on_event(event).await,
            ReadFrame::Malformed(e) => self.on_malformed(&e),
            ReadFrame::Closed => {
                let code = self.exit_code().await;
                Some(Crash::unexpected_exit(code))
            }
        }
    }

    /// Exit status of a worker whose output just closed.
    ///
    /// A process may close stdout and keep running, so the wait is bounded
    /// by [`EXIT_GRACE`]; past it the crash carries no status.
    async fn exit_code(&mut self) -> Option<i32> {
        let exit = self.exit.take()?;
        match tokio::time::timeout(EXIT_GRACE, exit).await {
            Ok(Ok(info)) => info.code,
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(worker = %self.name, "output closed but process still running");
                None
            }
        }
    }

    async fn on_event(&mut self, event: Event) -> Option<Crash> {
        match event.kind() {
            EventType::LOG => match LogRecord::from_event(&event) {
                Ok(record) => {
                    self.accepted();
                    self.store.ingest(&record);
                    lock(&self.shared.logs).send(&record);
                    None
                }
                Err(e) => self.on_malformed(&e),
            },
            EventType::CRASH => match Crash::from_event(&event) {
                Ok(crash) => {
                    self.accepted();
                    Some(crash)
                }
                Err(e) => self.on_malformed(&e),
            },
            EventType::TOPIC => match TopicEvent::from_event(&event) {
                Ok(signal) => {
                    self.accepted();
                    self.dispatch(Endpoint::Worker, &signal).await;
                    None
                }
                Err(e) => self.on_malformed(&e),
            },
            other => {
                self.accepted();
                warn!(worker = %self.name, kind = %other, "ignoring event of unknown type");
                None
            }
        }
    }

    fn accepted(&mut self) {
        self.malformed = 0;
        let started = self.state.send_if_modified(|state| {
            if *state == SupervisorState::Starting {
                *state = SupervisorState::Running;
                true
            } else {
                false
            }
        });
        if started {
            info!(worker = %self.name, "worker running");
        }
    }

    fn on_malformed(&mut self, reason: &dyn fmt::Display) -> Option<Crash> {
        self.malformed += 1;
        warn!(
            worker = %self.name,
            consecutive = self.malformed,
            error = %reason,
            "skipping malformed frame"
        );
        if self.max_decode_failures > 0 && self.malformed >= self.max_decode_failures {
            Some(Crash::malformed_stream(self.malformed))
        } else {
            None
        }
    }

    async fn dispatch(&mut self, from: Endpoint, signal: &TopicEvent) {
        for (endpoint, inbound) in self.router.on_signal(from, signal) {
            match endpoint {
                Endpoint::Parent => {
                    let reached = self.bus.deliver(&inbound);
                    debug!(topic = %inbound.sub(), reached, "delivered to parent bus");
                }
                Endpoint::Worker => self.send_to_worker(&inbound).await,
            }
        }
    }

    async fn send_to_worker(&mut self, signal: &TopicEvent) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let event = match signal.to_event() {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %signal.sub(), error = %e, "dropping topic value");
                return;
            }
        };
        if let Err(e) = write_frame(writer, &event).await {
            warn!(worker = %self.name, error = %e, "worker input closed, no further values are forwarded");
            self.writer = None;
        }
    }

    fn crash(&mut self, crash: Crash) {
        error!(worker = %self.name, %crash, "worker crashed");
        {
            let mut board = lock(&self.shared.crashes);
            board.observers.send(&crash);
            board.observers.close();
            board.last = Some(crash.clone());
        }
        self.teardown(Signal::SIGTERM);
        self.state.send_replace(SupervisorState::Crashed(Box::new(crash)));
    }

    fn stop(&mut self) {
        lock(&self.shared.crashes).observers.close();
        self.teardown(Signal::SIGINT);
        self.state.send_replace(SupervisorState::Stopped);
        info!(worker = %self.name, "worker stopped");
    }

    fn teardown(&mut self, signal: Signal) {
        lock(&self.shared.logs).close();
        self.bus.close();
        self.store.close();
        self.router.remove_endpoint(Endpoint::Worker);
        self.writer = None;

        let Some(pid) = self.pid else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            warn!(pid, "pid out of range, cannot signal worker");
            return;
        };
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) => debug!(pid, ?signal, "signalled worker"),
            Err(e) => debug!(pid, ?signal, error = %e, "could not signal worker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkbus_client::LogLevel;
    use tokio::io::{duplex, AsyncWriteExt};

    /// Write a length-prefixed body that is not a valid envelope.
    async fn write_garbage<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_u32(u32::try_from(body.len()).unwrap_or(u32::MAX)).await?;
        writer.write_all(body).await?;
        writer.flush().await
    }

    #[test]
    fn terminal_states() {
        assert!(!SupervisorState::Starting.is_terminal());
        assert!(!SupervisorState::Running.is_terminal());
        assert!(SupervisorState::Stopped.is_terminal());

        let crashed = SupervisorState::Crashed(Box::new(Crash::new("Fatal", "oops")));
        assert!(crashed.is_terminal());
        assert_eq!(crashed.to_string(), "crashed (Fatal: oops)");
        assert_eq!(crashed.crash().map(|c| c.error.name.as_str()), Some("Fatal"));
    }

    #[test]
    fn options_follow_config() {
        let mut config = ForkbusConfig::default();
        config.engine.name = "edge".to_string();
        config.supervisor.max_decode_failures = 3;

        let options = SupervisorOptions::from(&config);
        assert_eq!(options.name, "edge");
        assert_eq!(options.max_decode_failures, 3);
    }

    #[tokio::test]
    async fn first_valid_frame_marks_running() -> Result<(), Box<dyn std::error::Error>> {
        let (mut worker_out, parent_in) = duplex(64 * 1024);
        let (parent_out, _worker_in) = duplex(64 * 1024);
        let store = Arc::new(LogStore::new(10));
        let supervisor = Supervisor::attach(
            WorkerIo::new(parent_in, parent_out),
            SupervisorOptions::default(),
            store,
        );
        let mut logs = supervisor.logs();
        assert_eq!(supervisor.state(), SupervisorState::Starting);

        let record = LogRecord::new(LogLevel::Inf, "HELLO", "w", "1");
        write_frame(&mut worker_out, &record.to_event()?).await?;

        assert_eq!(logs.next().await.map(|r| r.code), Some("HELLO".to_string()));
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert_eq!(supervisor.stop().await, SupervisorState::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_types_do_not_count_as_malformed() -> Result<(), Box<dyn std::error::Error>> {
        let (mut worker_out, parent_in) = duplex(64 * 1024);
        let (parent_out, _worker_in) = duplex(64 * 1024);
        let options = SupervisorOptions {
            name: "w".to_string(),
            max_decode_failures: 1,
        };
        let supervisor =
            Supervisor::attach(WorkerIo::new(parent_in, parent_out), options, Arc::new(LogStore::new(10)));
        let mut logs = supervisor.logs();

        write_frame(&mut worker_out, &Event::create("XYZ", b"opaque".to_vec())?).await?;
        let record = LogRecord::new(LogLevel::War, "STILL_HERE", "w", "1");
        write_frame(&mut worker_out, &record.to_event()?).await?;

        assert_eq!(logs.next().await.map(|r| r.code), Some("STILL_HERE".to_string()));
        assert_eq!(supervisor.state(), SupervisorState::Running);
        Ok(())
    }

    #[tokio::test]
    async fn payload_decode_failure_counts_as_malformed() -> Result<(), Box<dyn std::error::Error>> {
        let (mut worker_out, parent_in) = duplex(64 * 1024);
        let (parent_out, _worker_in) = duplex(64 * 1024);
        let options = SupervisorOptions {
            name: "w".to_string(),
            max_decode_failures: 2,
        };
        let supervisor =
            Supervisor::attach(WorkerIo::new(parent_in, parent_out), options, Arc::new(LogStore::new(10)));

        write_frame(&mut worker_out, &Event::create("LOG", b"not msgpack".to_vec())?).await?;
        write_garbage(&mut worker_out, b"short").await?;

        let state = supervisor.wait().await;
        assert_eq!(state.crash().map(|c| c.error.name.as_str()), Some("MalformedStream"));
        Ok(())
    }

    #[tokio::test]
    async fn closed_output_crashes_while_process_lingers() -> Result<(), Box<dyn std::error::Error>> {
        let (worker_out, parent_in) = duplex(64 * 1024);
        let (parent_out, _worker_in) = duplex(64 * 1024);
        // The process never reports an exit.
        let (_exit_tx, exit_rx) = oneshot::channel();
        let io = WorkerIo {
            exit: Some(exit_rx),
            ..WorkerIo::new(parent_in, parent_out)
        };
        let supervisor = Supervisor::attach(io, SupervisorOptions::default(), Arc::new(LogStore::new(10)));
        let mut logs = supervisor.logs();

        drop(worker_out);

        let state = tokio::time::timeout(Duration::from_secs(5), supervisor.stop()).await?;
        let crash = state.crash().ok_or("expected a crash")?;
        assert_eq!(crash.error.name, "UnexpectedExit");
        assert!(crash.error.code.is_none());
        assert!(logs.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn known_exit_status_is_attached() -> Result<(), Box<dyn std::error::Error>> {
        let (worker_out, parent_in) = duplex(64 * 1024);
        let (parent_out, _worker_in) = duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let io = WorkerIo {
            exit: Some(exit_rx),
            ..WorkerIo::new(parent_in, parent_out)
        };
        let supervisor = Supervisor::attach(io, SupervisorOptions::default(), Arc::new(LogStore::new(10)));

        exit_tx
            .send(ExitInfo { code: Some(3) })
            .map_err(|_| "supervisor dropped the exit channel")?;
        drop(worker_out);

        let state = tokio::time::timeout(Duration::from_secs(5), supervisor.wait()).await?;
        let crash = state.crash().ok_or("expected a crash")?;
        assert_eq!(crash.error.code, Some(serde_json::json!(3)));
        Ok(())
    }
}
