//! Layered configuration.
//!
//! Precedence, highest first: CLI flags → environment → config file →
//! built-in defaults. The JSON config file supports `${VAR}` (required) and
//! `${VAR:-default}` (optional) interpolation on string scalars only;
//! placeholder resolution order is CLI overrides → process environment →
//! decrypted secrets store → literal default.
//!
//! Unknown top-level keys are a hard validation error. Unknown nested keys
//! under `polaris`, `output`, `logging`, `filter` only warn, so the config
//! file can stay forward-compatible with newer daemons.

use polaris_core::{Result, SubclientError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default config file location; the packaging drops one here.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/polaris/config.json";

/// Reconnection backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_pct: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_pct: 20,
        }
    }
}

/// Polaris API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolarisConfig {
    pub api_url: String,
    pub api_key: String,
    pub subscription: String,
    pub reconnect: ReconnectConfig,
}

impl Default for PolarisConfig {
    fn default() -> Self {
        Self {
            api_url: "wss://graphql.pointonenav.com/subscriptions".to_string(),
            api_key: String::new(),
            subscription: "devices".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// File rotation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RotationConfig {
    pub interval_seconds: u64,
    pub max_size_bytes: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 600,
            max_size_bytes: 52_428_800, // 50 MiB
        }
    }
}

/// Write-buffer flush thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlushConfig {
    pub interval_ms: u64,
    pub every_n_events: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            every_n_events: 50,
        }
    }
}

/// File-mode output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileOutputConfig {
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub rotation: RotationConfig,
    pub flush: FlushConfig,
}

impl Default for FileOutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/var/lib/polaris/data"),
            file_prefix: "events".to_string(),
            rotation: RotationConfig::default(),
            flush: FlushConfig::default(),
        }
    }
}

/// Output section wrapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub file: FileOutputConfig,
}

/// Event filtering rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    pub drop_states: Vec<String>,
    pub drop_device_ids: Vec<String>,
    pub keep_device_ids: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            drop_states: vec!["undefined".to_string(), "error".to_string()],
            drop_device_ids: Vec::new(),
            keep_device_ids: Vec::new(),
        }
    }
}

/// Operational log format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Optional rotating log file, in addition to stderr.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogFileConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_size_bytes: u64,
    pub backup_count: u32,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("/var/log/polaris-device-subclient/app.log"),
            max_size_bytes: 10_485_760, // 10 MiB
            backup_count: 5,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: LogFileConfig,
    pub redact_patterns: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            file: LogFileConfig::default(),
            redact_patterns: vec![
                "*key*".to_string(),
                "*token*".to_string(),
                "*secret*".to_string(),
                "*password*".to_string(),
            ],
        }
    }
}

/// Top-level application configuration, immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub instance_id: String,
    pub polaris: PolarisConfig,
    pub filter: FilterConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            instance_id: "writer-01".to_string(),
            polaris: PolarisConfig::default(),
            filter: FilterConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Sanity checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(SubclientError::Config("instance_id must not be empty".into()));
        }
        if !matches!(self.logging.level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(SubclientError::Config(format!(
                "logging.level must be one of debug/info/warn/error, got {:?}",
                self.logging.level
            )));
        }
        let r = &self.polaris.reconnect;
        if r.initial_delay_ms == 0 || r.max_delay_ms < r.initial_delay_ms {
            return Err(SubclientError::Config(
                "reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms".into(),
            ));
        }
        if r.backoff_multiplier < 1.0 {
            return Err(SubclientError::Config(
                "reconnect.backoff_multiplier must be >= 1".into(),
            ));
        }
        if r.jitter_pct > 100 {
            return Err(SubclientError::Config("reconnect.jitter_pct must be <= 100".into()));
        }
        let rot = &self.output.file.rotation;
        if rot.interval_seconds == 0 || rot.max_size_bytes == 0 {
            return Err(SubclientError::Config(
                "rotation thresholds must be non-zero".into(),
            ));
        }
        let fl = &self.output.file.flush;
        if fl.interval_ms == 0 || fl.every_n_events == 0 {
            return Err(SubclientError::Config("flush thresholds must be non-zero".into()));
        }
        Ok(())
    }
}

/// Sources consulted when resolving `${VAR}` placeholders, in order.
#[derive(Debug, Default)]
pub struct VarSources {
    /// CLI-supplied overrides, keyed by variable name.
    pub overrides: HashMap<String, String>,
    /// Decrypted secrets store.
    pub secrets: HashMap<String, String>,
}

impl VarSources {
    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(v) = self.overrides.get(name) {
            return Some(v.clone());
        }
        if let Ok(v) = std::env::var(name) {
            return Some(v);
        }
        self.secrets.get(name).cloned()
    }
}

/// Load, interpolate, and validate the config file.
///
/// `explicit` marks a path the operator asked for (CLI/env); a missing
/// explicit file is an error, while a missing file at the packaged default
/// path falls back to built-in defaults.
pub fn load(path: &Path, explicit: bool, sources: &VarSources) -> Result<AppConfig> {
    let raw = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            debug!(path = %path.display(), "No config file, using built-in defaults");
            let cfg = AppConfig::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        Err(e) => {
            return Err(SubclientError::Config(format!(
                "cannot read config file {}: {e}",
                path.display()
            )))
        }
    };

    let value: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| SubclientError::Config(format!("config file is not valid JSON: {e}")))?;

    check_keys(&value)?;
    let value = interpolate_value(value, sources)?;

    let cfg: AppConfig = serde_json::from_value(value)
        .map_err(|e| SubclientError::Config(format!("config file does not match schema: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

const TOP_LEVEL_KEYS: &[&str] = &["instance_id", "polaris", "filter", "output", "logging"];

const SECTION_KEYS: &[(&str, &[&str])] = &[
    ("polaris", &["api_url", "api_key", "subscription", "reconnect"]),
    ("filter", &["drop_states", "drop_device_ids", "keep_device_ids"]),
    ("output", &["file"]),
    ("logging", &["level", "format", "output", "file", "redact_patterns"]),
];

/// Enforce the unknown-key policy: top-level strict, sections warn-only.
fn check_keys(value: &serde_json::Value) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| SubclientError::Config("config root must be a JSON object".into()))?;

    for key in obj.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            return Err(SubclientError::Config(format!(
                "unknown top-level config key {key:?}"
            )));
        }
    }

    for (section, known) in SECTION_KEYS {
        if let Some(nested) = obj.get(*section).and_then(|v| v.as_object()) {
            for key in nested.keys() {
                if !known.contains(&key.as_str()) {
                    warn!(section, key = %key, "Ignoring unknown config key");
                }
            }
        }
    }
    Ok(())
}

/// Recursively interpolate `${VAR}` placeholders in string scalars.
fn interpolate_value(value: serde_json::Value, sources: &VarSources) -> Result<serde_json::Value> {
    Ok(match value {
        serde_json::Value::String(s) => serde_json::Value::String(interpolate(&s, sources)?),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| Ok((k, interpolate_value(v, sources)?)))
                .collect::<Result<_>>()?,
        ),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .into_iter()
                .map(|v| interpolate_value(v, sources))
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}

/// Replace every `${VAR}` / `${VAR:-default}` occurrence in `input`.
///
/// A `${VAR}` without a default that resolves nowhere is an error; malformed
/// placeholders (bad variable name, missing `}`) pass through verbatim.
fn interpolate(input: &str, sources: &VarSources) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let body = &rest[start + 2..];

        match parse_placeholder(body) {
            Some((name, default, consumed)) => {
                match sources.resolve(name) {
                    Some(v) => out.push_str(&v),
                    None => match default {
                        Some(d) => out.push_str(d),
                        None => {
                            return Err(SubclientError::Config(format!(
                                "required variable ${{{name}}} is not set in CLI overrides, \
                                 environment, or secrets"
                            )))
                        }
                    },
                }
                rest = &body[consumed..];
            }
            None => {
                out.push_str("${");
                rest = body;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Parse `VAR}` or `VAR:-default}` at the head of `body`.
///
/// Returns the variable name, the optional default, and how many bytes of
/// `body` were consumed (including the closing brace).
fn parse_placeholder(body: &str) -> Option<(&str, Option<&str>, usize)> {
    let bytes = body.as_bytes();
    let first = *bytes.first()?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let mut i = 1;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    let name = &body[..i];

    if body[i..].starts_with('}') {
        return Some((name, None, i + 1));
    }
    if body[i..].starts_with(":-") {
        let default_start = i + 2;
        let close = body[default_start..].find('}')?;
        let default = &body[default_start..default_start + close];
        return Some((name, Some(default), default_start + close + 1));
    }
    None
}
