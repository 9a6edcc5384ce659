//! Forkbus - supervise a worker process over a framed event channel.
//!
//! This is the main entry point for the forkbus engine, which:
//! - Loads configuration from TOML
//! - Initializes the log store (in-memory ring, optional JSON-lines files)
//! - Forks the worker with its module locators
//! - Renders worker logs to the console
//! - Handles graceful shutdown, or exits non-zero when the worker crashes

use anyhow::{bail, Context, Result};
use clap::Parser;
use forkbus_engine::config::{self, ForkbusConfig};
use forkbus_engine::sink::JsonLogSink;
use forkbus_engine::{console, LogStore, Supervisor, SupervisorState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Forkbus - supervise a worker process and mirror its event bus
#[derive(Parser, Debug)]
#[command(name = "forkbus")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the worker executable from config
    #[arg(short, long, value_name = "PATH")]
    worker: Option<PathBuf>,

    /// Run in verbose mode (debug logging)
    #[arg(short, long)]
    verbose: bool,

    /// Module locators passed to the worker, replacing the configured ones
    #[arg(value_name = "MODULES")]
    modules: Vec<String>,
}

/// Load configuration and apply command-line overrides.
fn load_config(args: &Args) -> Result<ForkbusConfig> {
    let (mut config, used) =
        config::discover(args.config.as_deref()).context("Failed to load configuration")?;
    match used {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    if let Some(worker) = &args.worker {
        config.worker.path = worker.clone();
    }
    if !args.modules.is_empty() {
        config.worker.modules = args.modules.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Initialize the log store based on configuration.
fn init_log_store(config: &ForkbusConfig) -> Result<LogStore> {
    let store = LogStore::new(config.store.ring_capacity);
    match &config.store.json_log_dir {
        Some(dir) => {
            info!("Initializing JSON log at {}", dir.display());
            let sink = JsonLogSink::new(dir).context("Failed to create JSON log")?;
            Ok(store.with_sink(sink))
        }
        None => Ok(store),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        "debug,worker=debug"
    } else {
        "info,worker=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let config = load_config(&args)?;
    info!("Engine name: {}", config.engine.name);

    let store = Arc::new(init_log_store(&config)?);
    let supervisor = Supervisor::spawn(&config, Arc::clone(&store))
        .with_context(|| format!("Failed to start worker {}", config.worker.path.display()))?;
    let console_task = tokio::spawn(console::run(supervisor.logs()));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let state = tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            supervisor.stop().await
        }
        _ = sigint.recv() => {
            info!("Received SIGINT (Ctrl+C)");
            supervisor.stop().await
        }
        state = supervisor.wait() => state,
    };

    if let Err(e) = console_task.await {
        error!("Console renderer failed: {}", e);
    }

    info!("Flushing log store...");
    store.flush();

    match state {
        SupervisorState::Crashed(crash) => {
            error!("{}", crash);
            if let Some(stack) = &crash.error.stack {
                error!("{}", stack);
            }
            bail!("worker crashed: {crash}")
        }
        other => {
            info!("Forkbus shutdown complete ({}).", other);
            Ok(())
        }
    }
}
