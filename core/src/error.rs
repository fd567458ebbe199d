//! Control-plane error type.
//!
//! Data-plane failures (unparseable frames, schema mismatches) never appear
//! here — they become `malformed` records. This enum covers the process-level
//! conditions that decide logging, retry, and exit codes.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the subclient.
pub type Result<T> = std::result::Result<T, SubclientError>;

/// Process-level error.
#[derive(Error, Debug)]
pub enum SubclientError {
    /// Configuration invalid or unresolvable. Exits 2 before any network I/O.
    #[error("configuration error: {0}")]
    Config(String),

    /// Could not establish a session in a mode that does not reconnect
    /// (dry-run). Exits 2.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Output directory unusable (missing, unwritable). Exits 3.
    #[error("output directory {path}: {source}")]
    OutputDir {
        /// The directory that could not be used.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encrypted secrets store unreadable.
    #[error("secrets store error: {0}")]
    Secrets(String),
}

impl SubclientError {
    /// Process exit code for this error, per the CLI contract:
    /// 2 = configuration/validation, 3 = fatal output I/O, 1 = everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            SubclientError::Config(_)
            | SubclientError::ConnectFailed(_)
            | SubclientError::Secrets(_) => 2,
            SubclientError::OutputDir { .. } => 3,
            SubclientError::Io(_) | SubclientError::Serialization(_) => 1,
        }
    }
}
