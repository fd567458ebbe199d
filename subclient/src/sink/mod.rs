//! Output sinks for serialized records.
//!
//! The pipeline drives exactly one sink. [`FileSink`] is the production
//! path: crash-safe rotating NDJSON files. [`StdoutSink`] serves dry-runs
//! and piping into other tools.

mod file;
mod stdout;

pub use file::FileSink;
pub use stdout::StdoutSink;

use async_trait::async_trait;
use polaris_core::Result;

/// Destination for NDJSON lines.
///
/// `write` receives one complete, newline-terminated line per record. The
/// pipeline calls `tick` on its timer for time-based flush and rotation,
/// and `close` exactly once on shutdown.
#[async_trait]
pub trait RecordSink: Send {
    /// Sink name for logging.
    fn name(&self) -> &'static str;

    /// Append one serialized record line.
    async fn write(&mut self, line: &[u8]) -> Result<()>;

    /// Timer wakeup: apply time-based flush/rotation policy.
    async fn tick(&mut self) -> Result<()>;

    /// Finalize and release resources. The sink must not be written after.
    async fn close(&mut self) -> Result<()>;
}
