/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Queued instrument operations run one at a time with graceful shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use stagectl_instrument::{Instrument, SimulatedInstrument};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use stagectl_daemon::{DaemonConfig, OperationRequest, TaskEvent, TaskRegistry, TaskSupervisor};

const LOG_FILE_PREFIX: &str = "stagectl-daemon.log";

#[derive(Parser, Debug)]
#[command(
    name = "stagectl-daemon",
    version,
    about = "Motion and alignment instrument control daemon"
)]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    /// Overrides log.level from the configuration
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Overrides registry.history_capacity from the configuration
    #[arg(long = "history-capacity", value_name = "N")]
    history_capacity: Option<usize>,
    /// Exit once the operation queue has drained instead of waiting for a signal
    #[arg(long = "once")]
    once: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut config = load_config(&args.config_path)?;
    if let Some(capacity) = args.history_capacity {
        config.registry.history_capacity = capacity;
        config.validate().context("validate overrides")?;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let _log_guard = init_tracing(log_level, config.log.directory.as_deref())?;

    info!(
        config_path = %args.config_path.display(),
        dry_run = args.dry_run,
        "starting stagectl-daemon"
    );
    info!(
        operation_count = config.operations.len(),
        history_capacity = config.registry.history_capacity,
        "configuration loaded"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let registry = Arc::new(TaskRegistry::new(config.registry.history_capacity));
    let instrument: Arc<dyn Instrument> =
        Arc::new(SimulatedInstrument::new(config.simulation.clone()));
    let supervisor = TaskSupervisor::new(Arc::clone(&registry), instrument, config.timing);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());
    tokio::spawn(log_events(registry.subscribe()));

    let drained = run_queue(&supervisor, &config.operations, &shutdown).await;
    if drained && args.once {
        info!("operation queue drained; exiting");
    } else if !shutdown.is_cancelled() {
        info!("operation queue drained; waiting for shutdown signal");
        shutdown.cancelled().await;
    }
    info!("shutdown signal received");

    supervisor
        .shutdown_and_wait()
        .await
        .context("shutdown tasks")?;
    info!("tasks shutdown complete");

    Ok(())
}

/// Run queued operations one after another. Returns false if interrupted by shutdown.
async fn run_queue(
    supervisor: &TaskSupervisor,
    operations: &[OperationRequest],
    shutdown: &CancellationToken,
) -> bool {
    for (index, request) in operations.iter().enumerate() {
        if shutdown.is_cancelled() {
            return false;
        }
        let task = match supervisor.submit(request.clone()) {
            Ok(task) => task,
            Err(err) => {
                warn!(index, kind = %request.kind(), error = %err, "operation not submitted");
                continue;
            }
        };

        let wait = supervisor.wait(task.id);
        tokio::pin!(wait);
        let finished = tokio::select! {
            res = &mut wait => res,
            _ = shutdown.cancelled() => {
                info!(task_id = %task.id, "shutdown requested; cancelling running task");
                if let Err(err) = supervisor.cancel(task.id).await {
                    debug!(task_id = %task.id, error = %err, "task already settled");
                }
                let res = wait.await;
                report_finished(index, res);
                return false;
            }
        };
        report_finished(index, finished);
    }
    true
}

fn report_finished(index: usize, finished: Result<stagectl_daemon::Task>) {
    match finished {
        Ok(task) => info!(
            index,
            task_id = %task.id,
            kind = %task.operation_kind,
            status = %task.status,
            error = task.error.as_deref().unwrap_or(""),
            "operation finished"
        ),
        Err(err) => warn!(index, error = %err, "operation did not finish cleanly"),
    }
}

async fn log_events(mut events: broadcast::Receiver<TaskEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let message = event
                    .progress
                    .get("message")
                    .and_then(|value| value.as_str())
                    .unwrap_or("");
                info!(
                    task_id = %event.task_id,
                    kind = %event.operation_kind,
                    status = %event.status,
                    message,
                    "task event"
                );
                debug!(task_id = %event.task_id, progress = ?event.progress, "task progress");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event logger lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_tracing(log_level: &str, directory: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(log_level),
    }
    .context("invalid log level")?;

    let (file_layer, guard) = match directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(guard)
}

fn load_config(path: &Path) -> Result<DaemonConfig> {
    DaemonConfig::load(path).with_context(|| format!("load config from {}", path.display()))
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
