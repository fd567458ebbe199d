//! The processing pipeline: bounded queue in, NDJSON lines out.
//!
//! One task consumes [`SessionEvent`]s in arrival order, runs each frame
//! through normalize → filter → sink, and services a timer for time-based
//! flush and rotation. Serial consumption is what makes the ordering and
//! `previous_state` guarantees hold; nothing here is concurrent on purpose.
//!
//! Shutdown: when the signal flips, the queue is drained through the same
//! path (bounded by [`DRAIN_TIMEOUT`]), then the sink is closed — which
//! finalizes the active file. The sink is closed even if processing
//! panicked, so a crash still publishes everything that reached the kernel.

use crate::connection::SessionEvent;
use crate::filter::EventFilter;
use crate::normalize::Normalizer;
use crate::sink::RecordSink;
use futures_util::FutureExt;
use polaris_core::{Result, SubclientError};
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Capacity of the raw-message queue between the connection task and the
/// pipeline. When full, the connection task stops reading the socket and
/// TCP back-pressure does the rest.
pub const RAW_QUEUE_CAPACITY: usize = 1024;

/// Records emitted before `--dry-run` exits.
pub const DRY_RUN_RECORD_LIMIT: u64 = 5;

/// Upper bound on post-shutdown queue draining.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the pipeline did over its lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineSummary {
    /// Records written to the sink (state_change + malformed).
    pub records_written: u64,
    /// Records dropped by the filter.
    pub records_filtered: u64,
    /// Malformed records among those written.
    pub malformed: u64,
}

enum Step {
    Continue,
    Stop,
}

/// The B→C→D stages of the pipeline, driven by one task.
pub struct Pipeline {
    rx: mpsc::Receiver<SessionEvent>,
    normalizer: Normalizer,
    filter: EventFilter,
    sink: Box<dyn RecordSink>,
    tick_interval: Duration,
    record_limit: Option<u64>,
    shutdown: watch::Receiver<bool>,
    summary: PipelineSummary,
}

impl Pipeline {
    pub fn new(
        instance_id: &str,
        filter: EventFilter,
        sink: Box<dyn RecordSink>,
        rx: mpsc::Receiver<SessionEvent>,
        shutdown: watch::Receiver<bool>,
        tick_interval: Duration,
        record_limit: Option<u64>,
    ) -> Self {
        Self {
            rx,
            normalizer: Normalizer::new(instance_id),
            filter,
            sink,
            tick_interval,
            record_limit,
            shutdown,
            summary: PipelineSummary::default(),
        }
    }

    /// Run to completion. Returns when the queue closes, the record limit is
    /// reached, or shutdown is signaled and the drain finishes.
    pub async fn run(mut self) -> Result<PipelineSummary> {
        let outcome = AssertUnwindSafe(self.process_until_done()).catch_unwind().await;

        // Finalize no matter how processing ended; the active file must not
        // stay `.active` over a clean exit.
        let close_result = self.sink.close().await;

        match outcome {
            Ok(Ok(())) => {
                close_result?;
                info!(
                    records = self.summary.records_written,
                    filtered = self.summary.records_filtered,
                    malformed = self.summary.malformed,
                    "pipeline shut down"
                );
                Ok(self.summary)
            }
            Ok(Err(e)) => {
                if let Err(close_err) = close_result {
                    warn!(error = %close_err, "sink close failed after pipeline error");
                }
                Err(e)
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(panic = %message, "pipeline panicked");
                if let Err(close_err) = close_result {
                    warn!(error = %close_err, "sink close failed after panic");
                }
                Err(SubclientError::Io(std::io::Error::other(format!(
                    "pipeline panicked: {message}"
                ))))
            }
        }
    }

    async fn process_until_done(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return self.drain().await;
                    }
                }

                event = self.rx.recv() => match event {
                    None => return Ok(()),
                    Some(event) => {
                        if let Step::Stop = self.handle(event).await? {
                            return Ok(());
                        }
                    }
                },

                _ = ticker.tick() => self.sink.tick().await?,
            }
        }
    }

    /// Post-shutdown: pull whatever is still queued through the pipeline,
    /// bounded in time so a stuck sink cannot hold the process hostage.
    async fn drain(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        debug!("draining queue");
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => {
                    warn!("drain timed out, some queued frames were not processed");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Ok(Some(event)) => {
                    if let Step::Stop = self.handle(event).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle(&mut self, event: SessionEvent) -> Result<Step> {
        match event {
            SessionEvent::Started { subscription_id } => {
                debug!(subscription_id = %subscription_id, "session started");
                self.normalizer.begin_session();
                Ok(Step::Continue)
            }
            SessionEvent::Ended => {
                self.normalizer.end_session();
                Ok(Step::Continue)
            }
            SessionEvent::Frame(raw) => {
                let record = self.normalizer.normalize(&raw);
                if record.is_malformed() {
                    self.summary.malformed += 1;
                }
                if !self.filter.keeps(&record) {
                    self.summary.records_filtered += 1;
                    return Ok(Step::Continue);
                }

                let line = record.to_ndjson()?;
                match self.sink.write(&line).await {
                    Ok(()) => {}
                    Err(SubclientError::Io(e))
                        if e.kind() == std::io::ErrorKind::BrokenPipe =>
                    {
                        warn!("output consumer went away, stopping");
                        return Ok(Step::Stop);
                    }
                    Err(e) => return Err(e),
                }

                self.summary.records_written += 1;
                if let Some(limit) = self.record_limit {
                    if self.summary.records_written >= limit {
                        info!(records = self.summary.records_written, "record limit reached");
                        return Ok(Step::Stop);
                    }
                }
                Ok(Step::Continue)
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
