//! Convenient re-exports for common usage.
//!
//! ```rust,ignore
//! use forkbus_client::prelude::*;
//!
//! run_worker(None, |ctx, _shutdown| async move {
//!     let ticks = ctx.bus().topic("ticks", Schema::<u64>::new());
//!     ticks.publish(&1);
//!     Ok(())
//! }).await?;
//! ```

pub use crate::bus::{Bus, Schema, Subscription, Topic};
pub use crate::log::{LogLevel, LogRecord};
pub use crate::logger::Logger;
pub use crate::metric::{MetricMutation, Record};
pub use crate::worker::{run_worker, BoxError, ShutdownReceiver, WorkerContext};
pub use crate::EventStream;

// Re-export StreamExt for convenient stream operations
pub use futures::StreamExt;
pub use serde_json::json;
