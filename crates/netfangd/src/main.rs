//! NetFang daemon - network classification and plugin orchestration
//!
//! Reads link and admin messages as JSON lines on stdin and writes every
//! dashboard event as a JSON line on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use netfang_common::{FingerprintStore, NetfangConfig, CONFIG_PATH};
use netfangd::{ControlMessage, Daemon, DaemonHandle, DashboardEvent};
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "netfangd")]
#[command(about = "NetFang - network classification and reconnaissance daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level regardless of the configured level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NetfangConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let level = if args.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Logs go to stderr; stdout carries the event stream
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("NetFang daemon v{} starting", env!("CARGO_PKG_VERSION"));

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = FingerprintStore::open(&config.database_path)
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;

    let (daemon, handle) = match Daemon::new(&config, store, Vec::new()) {
        Ok(built) => built,
        Err(e) => {
            error!("[CONFIG] Refusing to start: {}", e);
            return Err(e).context("Invalid plugin configuration");
        }
    };
    let supervisor = daemon.supervisor();

    let writer = tokio::spawn(write_events(handle.clone()));
    let reader = tokio::spawn(read_control(handle));

    tokio::select! {
        _ = daemon.run() => info!("Control feed closed"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl-c")?;
            info!("Interrupted");
        }
    }

    info!("Shutting down gracefully");
    supervisor.shutdown().await;
    reader.abort();
    writer.abort();
    Ok(())
}

fn emit(event: &DashboardEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to encode event: {}", e),
    }
}

async fn write_events(handle: DaemonHandle) {
    let mut subscription = handle.subscribe();
    if let Some(state) = subscription.state.take() {
        emit(&DashboardEvent::StateUpdate(state));
    }
    for alert in subscription.backlog.drain(..) {
        emit(&DashboardEvent::Alert(alert));
    }
    // A handle clone must not keep the daemon alive
    drop(handle);

    loop {
        match subscription.receiver.recv().await {
            Ok(event) => emit(&event),
            Err(RecvError::Lagged(missed)) => warn!("[BUS] Output fell behind, {} event(s) dropped", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn read_control(handle: DaemonHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read control feed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: ControlMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed control message: {}", e);
                continue;
            }
        };

        match handle.submit(message).await {
            Ok(None) => {}
            Ok(Some(response)) => println!(
                "{}",
                json!({"type": "admin_result", "payload": {"ok": true, "message": response.message}})
            ),
            Err(e) => println!(
                "{}",
                json!({"type": "admin_result", "payload": {"ok": false, "error": e.to_string()}})
            ),
        }
    }
    info!("Control feed reached EOF");
}
