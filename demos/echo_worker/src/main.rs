//! Echo Worker Example
//!
//! A worker hosting the resource modules named on its command line.
//! Demonstrates logs, metrics and topics flowing to the forkbus engine.
//!
//! Modules are given as `kind` or `kind:instance`:
//!
//! - `counter` counts ticks, publishes them on `counter.ticks` and keeps a
//!   `counters` metric up to date;
//! - `echo` answers every value on `echo.requests` on `echo.replies`.
//!
//! # Usage
//!
//! ```bash
//! forkbus --worker ./target/debug/echo_worker counter echo:e1
//! ```

use forkbus_client::prelude::*;
use forkbus_client::WorkerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

/// Payload of `counter.ticks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tick {
    instance: String,
    sequence: u64,
}

/// Split a module locator into kind and instance name.
fn parse_locator(locator: &str) -> (&str, &str) {
    match locator.split_once(':') {
        Some((kind, instance)) if !instance.is_empty() => (kind, instance),
        Some((kind, _)) => (kind, kind),
        None => (locator, locator),
    }
}

async fn run_counter(ctx: WorkerContext, instance: String) -> Result<(), BoxError> {
    let log = ctx.logger("counter", instance.as_str());
    let ticks = ctx.bus().topic("counter.ticks", Schema::<Tick>::new());
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut sequence: u64 = 0;

    log.info("COUNTER_STARTED").emit();
    loop {
        interval.tick().await;
        sequence += 1;

        let tick = Tick {
            instance: instance.clone(),
            sequence,
        };
        ticks.publish(&tick);

        let row: Record = serde_json::from_value(json!({"id": instance, "count": sequence}))?;
        log.info("TICK")
            .data(json!({"sequence": sequence}))
            .metric("counters", MetricMutation::upsert([row]))
            .emit();
    }
}

async fn run_echo(ctx: WorkerContext, instance: String) -> Result<(), BoxError> {
    let log = ctx.logger("echo", instance.as_str());
    let replies = ctx.bus().topic("echo.replies", Schema::<serde_json::Value>::new());
    let mut requests = ctx
        .bus()
        .topic("echo.requests", Schema::<serde_json::Value>::new())
        .with_queue("echo")
        .subscribe();

    log.info("ECHO_STARTED").emit();
    let mut answered: u64 = 0;
    while let Some(request) = requests.next().await {
        answered += 1;
        replies.publish(&request);

        let row: Record = serde_json::from_value(json!({"id": instance, "answered": answered}))?;
        log.info("ECHOED")
            .data(request)
            .metric("echoes", MetricMutation::upsert([row]))
            .emit();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the event channel; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = run_worker(None, |ctx, mut shutdown| async move {
        let mut modules = JoinSet::new();
        for locator in ctx.modules() {
            let (kind, instance) = parse_locator(locator);
            let instance = instance.to_string();
            match kind {
                "counter" => modules.spawn(run_counter(ctx.clone(), instance)),
                "echo" => modules.spawn(run_echo(ctx.clone(), instance)),
                other => return Err(BoxError::from(format!("unknown module '{other}'"))),
            };
        }
        if modules.is_empty() {
            tracing::warn!("no modules requested, idling until shutdown");
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(finished) = modules.join_next() => finished??,
            }
        }
        modules.shutdown().await;
        Ok::<(), BoxError>(())
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        // The crash has already been reported to the engine.
        Err(WorkerError::Crashed(_)) => std::process::exit(1),
        Err(e) => Err(e.into()),
    }
}
