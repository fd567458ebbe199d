//! Process wiring: configuration → tasks → signals → shutdown.
//!
//! `execute` is everything `main` does short of exit-code mapping: resolve
//! the layered configuration, set up redacted logging, then (unless
//! `--validate-config`) spawn the connection and pipeline tasks and wait
//! for a shutdown signal or pipeline completion.

use crate::cli::{Cli, OutputMode};
use crate::config::{self, VarSources, DEFAULT_CONFIG_PATH};
use crate::connection::ConnectionManager;
use crate::filter::EventFilter;
use crate::logging;
use crate::pipeline::{Pipeline, PipelineSummary, DRY_RUN_RECORD_LIMIT, RAW_QUEUE_CAPACITY};
use crate::redact::{collect_secret_values, Redactor};
use crate::secrets;
use crate::sink::{FileSink, RecordSink, StdoutSink};
use polaris_core::{Result, SubclientError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Default location of the encrypted secrets store.
const DEFAULT_SECRETS_FILE: &str = "/etc/polaris/.secrets.enc";

/// How long to wait for the connection task after the pipeline finished.
const CONNECTION_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Run the subclient to completion.
pub async fn execute(cli: Cli) -> Result<()> {
    let (config_path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    let sources = VarSources {
        overrides: cli.var_overrides(),
        secrets: load_secrets_if_configured()?,
    };
    let mut cfg = config::load(&config_path, explicit, &sources)?;

    // Direct overrides sit above anything the file said.
    if let Some(key) = &cli.polaris_api_key {
        cfg.polaris.api_key = key.clone();
    }
    if let Some(url) = &cli.polaris_api_url {
        cfg.polaris.api_url = url.clone();
    }
    if let Some(dir) = &cli.output_dir {
        cfg.output.file.output_dir = dir.clone();
    }

    let level = cli
        .log_level
        .map(|l| l.as_str().to_string())
        .unwrap_or_else(|| cfg.logging.level.clone());

    // Collect secret values from the *resolved* config so CLI- and
    // env-supplied credentials are redacted too.
    let resolved = serde_json::to_value(&cfg)?;
    let redactor = Redactor::new(collect_secret_values(&resolved, &cfg.logging.redact_patterns));
    logging::init(&cfg.logging, &level, &redactor)?;

    if cli.validate_config {
        eprintln!("Configuration is valid.");
        return Ok(());
    }

    if cfg.polaris.api_key.is_empty() {
        warn!("polaris.api_key is empty, the server will likely reject the connection");
    }

    let output_mode = cli.output.unwrap_or_default();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance_id = %cfg.instance_id,
        output = ?output_mode,
        dry_run = cli.dry_run,
        "starting polaris-device-subclient"
    );

    run_pipeline(cfg, output_mode, cli.dry_run).await?;
    Ok(())
}

/// Spawn connection + pipeline, wait for a signal or natural completion.
async fn run_pipeline(
    cfg: config::AppConfig,
    output_mode: OutputMode,
    dry_run: bool,
) -> Result<PipelineSummary> {
    let sink: Box<dyn RecordSink> = match output_mode {
        OutputMode::Stdout => Box::new(StdoutSink::new()),
        OutputMode::File => Box::new(FileSink::new(&cfg.output.file, &cfg.instance_id)?),
    };

    let (tx, rx) = mpsc::channel(RAW_QUEUE_CAPACITY);
    let (shutdown_tx, _) = watch::channel(false);

    let manager = ConnectionManager::new(cfg.polaris.clone(), tx, shutdown_tx.subscribe())
        .fail_fast(dry_run);
    let pipeline = Pipeline::new(
        &cfg.instance_id,
        EventFilter::new(&cfg.filter),
        sink,
        rx,
        shutdown_tx.subscribe(),
        Duration::from_millis(cfg.output.file.flush.interval_ms),
        dry_run.then_some(DRY_RUN_RECORD_LIMIT),
    );

    let connection_task = tokio::spawn(manager.run());
    let mut pipeline_task = tokio::spawn(pipeline.run());

    let pipeline_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
            pipeline_task.await
        }
        result = &mut pipeline_task => {
            // Pipeline finished on its own: dry-run limit, consumer gone,
            // or a fatal sink error. Stop the connection too.
            let _ = shutdown_tx.send(true);
            result
        }
    };

    let connection_result =
        match tokio::time::timeout(CONNECTION_EXIT_GRACE, connection_task).await {
            Ok(result) => result,
            Err(_) => {
                warn!("connection task did not stop in time");
                return finish(pipeline_result, Ok(Ok(())));
            }
        };

    finish(pipeline_result, connection_result)
}

type TaskResult<T> = std::result::Result<Result<T>, tokio::task::JoinError>;

/// Fold the two task results into one, pipeline errors first.
fn finish(
    pipeline: TaskResult<PipelineSummary>,
    connection: TaskResult<()>,
) -> Result<PipelineSummary> {
    let summary = match pipeline {
        Ok(result) => result?,
        Err(join_err) => {
            error!(error = %join_err, "pipeline task failed");
            return Err(SubclientError::Io(std::io::Error::other(join_err)));
        }
    };

    match connection {
        Ok(Ok(())) => Ok(summary),
        // fail_fast (dry-run) connect failure surfaces here.
        Ok(Err(e)) => Err(e),
        Err(join_err) => {
            error!(error = %join_err, "connection task failed");
            Err(SubclientError::Io(std::io::Error::other(join_err)))
        }
    }
}

/// Secrets store participates in interpolation only when the operator has
/// pointed `POLARIS_KEY_FILE` at an existing key and the store file exists.
fn load_secrets_if_configured() -> Result<HashMap<String, String>> {
    let Ok(key_file) = std::env::var("POLARIS_KEY_FILE") else {
        return Ok(HashMap::new());
    };
    let secrets_file = std::env::var("POLARIS_SECRETS_FILE")
        .unwrap_or_else(|_| DEFAULT_SECRETS_FILE.to_string());

    let key_path = PathBuf::from(&key_file);
    let secrets_path = PathBuf::from(&secrets_file);
    if !key_path.exists() || !secrets_path.exists() {
        return Ok(HashMap::new());
    }

    let store = secrets::load(&secrets_path, &key_path)?;
    info!(count = store.len(), "loaded encrypted secrets");
    Ok(store)
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
