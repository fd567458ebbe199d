//! Tracing subscriber setup.
//!
//! Operational logs go to stderr (JSON by default, pretty for humans) and
//! optionally to a size-rotated file. Both sinks sit behind the secret
//! redactor, so nothing matching `logging.redact_patterns` can reach disk
//! or journald in the clear.

use crate::config::{LogFormat, LoggingConfig};
use crate::redact::{Redactor, RedactingMakeWriter};
use crate::rolling::RollingFileWriter;
use polaris_core::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialise the global subscriber.
///
/// `level` is the effective verbosity after CLI/env overrides; an explicit
/// `RUST_LOG` still wins, matching the usual tracing convention.
pub fn init(cfg: &LoggingConfig, level: &str, redactor: &Redactor) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_writer = RedactingMakeWriter::new(std::io::stderr, redactor.clone());

    // The optional log file is always JSON — it exists to be shipped, not read.
    let file_layer = if cfg.file.enabled {
        let rolling = RollingFileWriter::new(
            &cfg.file.path,
            cfg.file.max_size_bytes,
            cfg.file.backup_count,
        )?;
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(RedactingMakeWriter::new(rolling, redactor.clone())),
        )
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);

    match cfg.format {
        LogFormat::Json => {
            let _ = registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(stderr_writer),
                )
                .try_init();
        }
        LogFormat::Pretty => {
            let _ = registry
                .with(tracing_subscriber::fmt::layer().with_writer(stderr_writer))
                .try_init();
        }
    }
    Ok(())
}
