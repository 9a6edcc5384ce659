//! Forkbus Engine - supervisor side of the forkbus event transport.
//!
//! The engine forks one worker process and presents its output as
//! independent streams: logs, crashes and topic traffic. Logs and metric
//! mutations are retained by the [`LogStore`] for replay to late
//! observers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Forkbus Engine                            │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────────────┐ │
//! │  │  Supervisor  │──►│   LogStore   │──►│ JSON-lines sink (opt) │ │
//! │  │ + TopicRouter│   │ ring+metrics │   └───────────────────────┘ │
//! │  └──────┬───────┘   └──────────────┘                             │
//! │         │ parent Bus                                             │
//! └─────────┼────────────────────────────────────────────────────────┘
//!           │ stdin/stdout, length-prefixed Events
//!           ▼
//!      ┌──────────┐
//!      │  Worker  │  (forkbus-client::run_worker)
//!      └──────────┘
//! ```

pub mod config;
pub mod console;
pub mod log_store;
pub mod router;
pub mod sink;
pub mod supervisor;

pub use config::{ConfigError, ForkbusConfig};
pub use log_store::{LogStore, MetricFrame};
pub use router::{Endpoint, TopicRouter};
pub use sink::{JsonLogSink, LogSink, StoreError};
pub use supervisor::{
    ExitInfo, Supervisor, SupervisorError, SupervisorOptions, SupervisorState, WorkerIo,
};
