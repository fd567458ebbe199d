//! Command-line surface.
//!
//! Every flag has a `POLARIS_*` environment fallback; clap resolves the
//! precedence (flag beats env), and the config loader handles the rest of
//! the layering down to file values and built-in defaults.

use clap::{Parser, ValueEnum};
use std::collections::HashMap;
use std::path::PathBuf;

/// Where records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputMode {
    /// Rotating NDJSON files in the output directory.
    #[default]
    File,
    /// Newline-delimited JSON on standard output.
    Stdout,
}

/// Log verbosity, mirroring `logging.level` in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Polaris device state change to NDJSON file pipeline.
#[derive(Debug, Parser)]
#[command(name = "polaris-device-subclient", version, about)]
pub struct Cli {
    /// Output mode.
    #[arg(short, long, value_enum, env = "POLARIS_OUTPUT")]
    pub output: Option<OutputMode>,

    /// Override output.file.output_dir.
    #[arg(short = 'd', long, env = "POLARIS_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Config file path.
    #[arg(short, long, env = "POLARIS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log verbosity.
    #[arg(long, value_enum, env = "POLARIS_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Connect, emit the first 5 records, then exit.
    #[arg(long)]
    pub dry_run: bool,

    /// Parse the config, resolve credentials, and exit without any network
    /// I/O.
    #[arg(long)]
    pub validate_config: bool,

    /// Override the Polaris API key.
    #[arg(long, env = "POLARIS_API_KEY", hide_env_values = true)]
    pub polaris_api_key: Option<String>,

    /// Override the Polaris API URL.
    #[arg(long, env = "POLARIS_API_URL")]
    pub polaris_api_url: Option<String>,
}

impl Cli {
    /// Credential overrides as `${VAR}` interpolation sources.
    pub fn var_overrides(&self) -> HashMap<String, String> {
        let mut overrides = HashMap::new();
        if let Some(key) = &self.polaris_api_key {
            overrides.insert("POLARIS_API_KEY".to_string(), key.clone());
        }
        if let Some(url) = &self.polaris_api_url {
            overrides.insert("POLARIS_API_URL".to_string(), url.clone());
        }
        overrides
    }
}
