//! Forkbus Client Library
//!
//! This crate is linked by both sides of a forkbus process boundary: the
//! worker that hosts resources and the engine that supervises it.
//!
//! # Building blocks
//!
//! - [`Event`] - the binary envelope every unit of traffic travels in
//! - [`Bus`] / [`Topic`] - in-process publish/subscribe with `ON`/`OFF`
//!   lifecycle signals for cross-process mirroring
//! - [`LogRecord`] / [`Logger`] - structured logs that may carry metric
//!   mutations
//! - [`metric::apply`] - the pure fold from mutations to metric snapshots
//! - [`Crash`] - a fatal error in transit
//! - [`run_worker`] - the worker runtime
//!
//! # Example: Worker
//!
//! ```rust,ignore
//! use forkbus_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     run_worker(None, |ctx, mut shutdown| async move {
//!         let log = ctx.logger("echo", "e1");
//!         let mut requests = ctx.bus().topic("echo.in", Schema::<String>::new()).subscribe();
//!         let replies = ctx.bus().topic("echo.out", Schema::<String>::new());
//!
//!         loop {
//!             tokio::select! {
//!                 _ = shutdown.changed() => break,
//!                 Some(text) = requests.next() => {
//!                     log.info("ECHO").data(json!({"text": text})).emit();
//!                     replies.publish(&text);
//!                 }
//!             }
//!         }
//!         Ok(())
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod crash;
mod error;
pub mod event;
pub mod fanout;
pub mod frame;
pub mod log;
pub mod logger;
pub mod metric;
pub mod prelude;
mod stream;
pub mod topic;
pub mod types;
pub mod worker;

pub use bus::{Bus, Schema, Subscription, Topic};
pub use crash::{Crash, SerializedError};
pub use error::{DecodeError, EventError, WorkerError, WorkerResult};
pub use event::{Event, HEADER_LEN, MAX_DATA_SIZE};
pub use fanout::Fanout;
pub use log::{LogLevel, LogRecord, ResourceKey};
pub use logger::{LogBuilder, Logger};
pub use metric::{MetricMutation, MutationOp, Record};
pub use stream::EventStream;
pub use topic::{TopicEvent, TopicSignal};
pub use worker::{
    run_worker, run_worker_with_io, BoxError, ShutdownReceiver, WorkerContext, NAME_ENV,
};
