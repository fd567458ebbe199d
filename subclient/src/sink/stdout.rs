//! Stdout sink - for dry-runs and piping.
//!
//! No rotation, flushed after every record so a consumer sees lines as they
//! happen.

use super::RecordSink;
use async_trait::async_trait;
use polaris_core::Result;
use std::io::Write;

/// Writes NDJSON lines straight to standard output.
#[derive(Default)]
pub struct StdoutSink {
    written: u64,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total records written.
    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl RecordSink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn write(&mut self, line: &[u8]) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(line)?;
        stdout.flush()?;
        self.written += 1;
        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        std::io::stdout().lock().flush()?;
        Ok(())
    }
}
