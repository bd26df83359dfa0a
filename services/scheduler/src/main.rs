//! berth scheduler
//!
//! Runs the offer-driven scheduling loop against a resource manager that is
//! bridged over standard streams:
//!
//! - **stdin**: newline-delimited JSON events (`OFFERS`, `UPDATE`, ...) and
//!   task API commands (`{"command": "scale", ...}`)
//! - **stdout**: newline-delimited JSON calls (`ACCEPT`, `DECLINE`, `KILL`, ...)
//!
//! Logs go to stderr as JSON.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use berth_events::Event;
use berth_scheduler::config::Config;
use berth_scheduler::lifecycle::Command;
use berth_scheduler::store::FileStore;
use berth_scheduler::sync::TaskStore;
use berth_scheduler::transport::JsonLinesTransport;
use berth_scheduler::worker::{Input, SchedulerWorker};
use berth_scheduler::SchedulerState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!(
        framework = %config.framework_name,
        scheduler_host = %config.scheduler_host,
        store_dir = ?config.store_dir,
        "Starting berth scheduler"
    );

    let mut definitions = config.load_definitions()?;

    // Open the durable store when configured
    let store = match &config.store_dir {
        Some(dir) => {
            let files = FileStore::open(dir)
                .await
                .with_context(|| format!("failed to open store at {}", dir.display()))?;
            let store = TaskStore::new(Arc::new(files), &config.framework_name);
            store.load_task_defs(&mut definitions).await?;
            Some(store)
        }
        None => {
            warn!("No store directory configured, task state will not survive restarts");
            None
        }
    };

    let state = SchedulerState::new(config.scheduler_options(), definitions)?;
    info!(pending = state.pending.len(), "Task definitions loaded");

    let transport = Arc::new(JsonLinesTransport::stdout());
    let mut worker = SchedulerWorker::new(state, transport, store, config.worker_config());
    worker.recover().await?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (input_tx, input_rx) = mpsc::channel(256);

    let worker_handle = tokio::spawn(worker.run(input_rx, shutdown_rx));
    let reader_handle = tokio::spawn(read_inputs(input_tx));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reader_handle => {
            match result {
                Ok(Ok(())) => info!("Input stream ended"),
                Ok(Err(e)) => error!(error = %e, "Input reader error"),
                Err(e) => error!(error = %e, "Input reader panicked"),
            }
        }
    }

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);

    info!("Waiting for scheduler worker to shut down...");
    match tokio::time::timeout(Duration::from_secs(5), worker_handle).await {
        Ok(Ok(state)) => info!(
            pending = state.pending.len(),
            launched = state.launched.len(),
            "Scheduler shutdown complete"
        ),
        Ok(Err(e)) => error!(error = %e, "Scheduler worker panicked"),
        Err(_) => warn!("Scheduler worker did not stop in time"),
    }

    Ok(())
}

/// Forward stdin lines to the worker until stdin closes.
async fn read_inputs(inputs: mpsc::Sender<Input>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(input) = decode_input(line) else {
            continue;
        };
        if inputs.send(input).await.is_err() {
            debug!("Worker stopped, no longer reading input");
            break;
        }
    }
    Ok(())
}

fn decode_input(line: &str) -> Option<Input> {
    match Event::from_json(line) {
        Ok(event) => return Some(Input::Event(event)),
        Err(event_err) => match serde_json::from_str::<Command>(line) {
            Ok(command) => return Some(Input::Command(command)),
            Err(command_err) => warn!(
                event_error = %event_err,
                command_error = %command_err,
                "Ignoring unreadable input line"
            ),
        },
    }
    None
}
