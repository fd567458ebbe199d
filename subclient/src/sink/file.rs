//! Rotating NDJSON file sink.
//!
//! Records append to `{prefix}-{instance_id}-{timestamp}.ndjson.active`.
//! When the file crosses the age or size threshold it is finalized —
//! flush, `fsync`, close, atomic rename to `.ndjson`, `fsync` of the
//! directory — and a fresh active file opens. A filename ending in plain
//! `.ndjson` is immutable and byte-complete through its last newline; that
//! is the entire contract with downstream tailers.
//!
//! Each line goes to the kernel in a single `write` call; nothing is
//! buffered in user space, so a torn line can only come from a torn
//! syscall, and the startup recovery scan truncates those away.

use super::RecordSink;
use crate::config::FileOutputConfig;
use async_trait::async_trait;
use chrono::Utc;
use polaris_core::{Result, SubclientError};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Wait before the single retry of a failed write.
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Wait after giving up on a descriptor before opening a new file.
const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ActiveFile {
    file: File,
    active_path: PathBuf,
    final_path: PathBuf,
    opened_at: Instant,
    bytes_written: u64,
    events_since_flush: u64,
    last_flush: Instant,
}

/// Crash-safe rotating NDJSON writer.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    prefix: String,
    instance_id: String,
    rotation_interval: Duration,
    max_size_bytes: u64,
    flush_every_n: u64,
    flush_interval: Duration,

    active: Option<ActiveFile>,

    records_written: u64,
    records_dropped: u64,
    write_errors: u64,
    rotations: u64,
}

impl FileSink {
    /// Create the output directory if needed, finalize leftovers from a
    /// previous run, and open the first active file.
    pub fn new(cfg: &FileOutputConfig, instance_id: &str) -> Result<Self> {
        fs::create_dir_all(&cfg.output_dir).map_err(|e| SubclientError::OutputDir {
            path: cfg.output_dir.clone(),
            source: e,
        })?;

        recover_leftovers(&cfg.output_dir)?;

        let mut sink = Self {
            dir: cfg.output_dir.clone(),
            prefix: cfg.file_prefix.clone(),
            instance_id: sanitize_instance_id(instance_id),
            rotation_interval: Duration::from_secs(cfg.rotation.interval_seconds),
            max_size_bytes: cfg.rotation.max_size_bytes,
            flush_every_n: cfg.flush.every_n_events,
            flush_interval: Duration::from_millis(cfg.flush.interval_ms),
            active: None,
            records_written: 0,
            records_dropped: 0,
            write_errors: 0,
            rotations: 0,
        };
        sink.open_new_file()?;
        Ok(sink)
    }

    /// Records successfully handed to the kernel.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Records lost to write failures.
    pub fn records_dropped(&self) -> u64 {
        self.records_dropped
    }

    /// Failed write syscalls (before and after retry).
    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    /// Completed rotations.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    fn open_new_file(&mut self) -> Result<()> {
        let ts = Utc::now().format("%Y%m%dT%H%M%SZ");
        let base = format!("{}-{}-{}", self.prefix, self.instance_id, ts);

        // Rotating more than once within a second needs a distinct name.
        let mut candidate = base.clone();
        let mut n = 1u32;
        let (active_path, final_path, file) = loop {
            let active = self.dir.join(format!("{candidate}.ndjson.active"));
            let fin = self.dir.join(format!("{candidate}.ndjson"));
            if !fin.exists() {
                match OpenOptions::new().append(true).create_new(true).open(&active) {
                    Ok(file) => break (active, fin, file),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => {
                        return Err(SubclientError::OutputDir {
                            path: self.dir.clone(),
                            source: e,
                        })
                    }
                }
            }
            n += 1;
            candidate = format!("{base}-{n}");
        };

        info!(file = %active_path.display(), "opened new output file");
        self.active = Some(ActiveFile {
            file,
            active_path,
            final_path,
            opened_at: Instant::now(),
            bytes_written: 0,
            events_since_flush: 0,
            last_flush: Instant::now(),
        });
        Ok(())
    }

    fn should_rotate(&self) -> bool {
        match &self.active {
            Some(a) => {
                a.opened_at.elapsed() >= self.rotation_interval
                    || a.bytes_written >= self.max_size_bytes
            }
            None => false,
        }
    }

    fn should_flush(&self) -> bool {
        match &self.active {
            Some(a) => {
                a.events_since_flush >= self.flush_every_n
                    || a.last_flush.elapsed() >= self.flush_interval
            }
            None => false,
        }
    }

    fn flush_active(&mut self) -> std::io::Result<()> {
        if let Some(a) = &mut self.active {
            a.file.flush()?;
            a.events_since_flush = 0;
            a.last_flush = Instant::now();
        }
        Ok(())
    }

    /// Finalize the active file: fsync, close, rename, fsync the directory.
    fn finalize_active(&mut self) -> Result<()> {
        let Some(mut a) = self.active.take() else {
            return Ok(());
        };

        a.file.flush()?;
        a.file.sync_all()?;
        drop(a.file);

        if a.bytes_written == 0 {
            // Nothing of value; don't publish empty files.
            let _ = fs::remove_file(&a.active_path);
            return Ok(());
        }

        fs::rename(&a.active_path, &a.final_path).map_err(|e| SubclientError::OutputDir {
            path: self.dir.clone(),
            source: e,
        })?;
        fsync_dir(&self.dir)?;

        info!(
            file = %a.final_path.display(),
            bytes = a.bytes_written,
            "finalized output file"
        );
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.finalize_active()?;
        self.rotations += 1;
        self.open_new_file()
    }

    /// Give up on the current descriptor: finalize whatever made it to disk
    /// and open a fresh file after a short pause.
    async fn recover_from_write_failure(&mut self) -> Result<()> {
        if let Err(e) = self.finalize_active() {
            warn!(error = %e, "failed to finalize after write error");
        }
        tokio::time::sleep(REOPEN_BACKOFF).await;
        self.open_new_file()
    }
}

#[async_trait]
impl RecordSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn write(&mut self, line: &[u8]) -> Result<()> {
        if self.active.is_none() {
            self.open_new_file()?;
        }

        // One write syscall per line; retry once on a transient failure.
        let mut attempt = 0;
        loop {
            let result = match &mut self.active {
                Some(a) => a.file.write_all(line),
                None => break,
            };
            match result {
                Ok(()) => {
                    let a = self
                        .active
                        .as_mut()
                        .ok_or_else(|| SubclientError::Config("active file vanished".into()))?;
                    a.bytes_written += line.len() as u64;
                    a.events_since_flush += 1;
                    self.records_written += 1;

                    if self.should_rotate() {
                        self.rotate()?;
                    } else if self.should_flush() {
                        self.flush_active()?;
                    }
                    return Ok(());
                }
                Err(e) if attempt == 0 => {
                    self.write_errors += 1;
                    warn!(error = %e, "write_error");
                    attempt = 1;
                    tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
                }
                Err(e) => {
                    self.write_errors += 1;
                    self.records_dropped += 1;
                    warn!(error = %e, "write_error");
                    return self.recover_from_write_failure().await;
                }
            }
        }
        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        if self.should_rotate() {
            self.rotate()?;
        } else if self.should_flush() {
            self.flush_active()?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        debug!(
            records = self.records_written,
            dropped = self.records_dropped,
            rotations = self.rotations,
            "closing file sink"
        );
        self.finalize_active()
    }
}

/// Replace anything outside `[A-Za-z0-9_]` so the instance id is filename-safe.
fn sanitize_instance_id(instance_id: &str) -> String {
    instance_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Startup recovery: finalize `.ndjson.active` files a previous process left
/// behind. Complete files are renamed; a torn last line is truncated away
/// first; files with no complete line are removed. Idempotent — running it
/// against an already-clean directory does nothing.
fn recover_leftovers(dir: &Path) -> Result<()> {
    let mut changed = false;

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        let Some(stem) = name.strip_suffix(".ndjson.active") else {
            continue;
        };

        let contents = fs::read(&path)?;
        let keep = match contents.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };

        if keep == 0 {
            info!(file = %path.display(), "removing empty leftover active file");
            fs::remove_file(&path)?;
            changed = true;
            continue;
        }

        if keep < contents.len() {
            info!(
                file = %path.display(),
                truncated = contents.len() - keep,
                "truncating torn last line"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(keep as u64)?;
            file.sync_all()?;
        }

        let final_path = dir.join(format!("{stem}.ndjson"));
        if final_path.exists() {
            warn!(file = %path.display(), "finalized twin already exists, leaving in place");
            continue;
        }
        fs::rename(&path, &final_path)?;
        info!(file = %final_path.display(), "recovered leftover active file");
        changed = true;
    }

    if changed {
        fsync_dir(dir)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{FlushConfig, RotationConfig};

    fn cfg(dir: &Path, max_size_bytes: u64, interval_seconds: u64) -> FileOutputConfig {
        FileOutputConfig {
            output_dir: dir.to_path_buf(),
            file_prefix: "test".to_string(),
            rotation: RotationConfig {
                interval_seconds,
                max_size_bytes,
            },
            flush: FlushConfig {
                interval_ms: 1000,
                every_n_events: 50,
            },
        }
    }

    fn list(dir: &Path, suffix: &str) -> Vec<PathBuf> {
        let mut v: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(suffix))
            .collect();
        v.sort();
        v
    }

    fn actives(dir: &Path) -> Vec<PathBuf> {
        list(dir, ".ndjson.active")
    }

    fn finals(dir: &Path) -> Vec<PathBuf> {
        list(dir, ".ndjson")
            .into_iter()
            .filter(|p| !p.to_string_lossy().ends_with(".active"))
            .collect()
    }

    #[tokio::test]
    async fn creates_active_file_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(&cfg(dir.path(), 1_000_000, 3600), "inst-01").unwrap();
        let active = actives(dir.path());
        assert_eq!(active.len(), 1);
        assert!(active[0].to_string_lossy().contains("test-inst-01-"));
        drop(sink);
    }

    #[tokio::test]
    async fn rotates_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(&cfg(dir.path(), 500, 3600), "inst-01").unwrap();

        let line = format!("{{\"pad\":\"{}\"}}\n", "x".repeat(110));
        let mut wrote = 0u64;
        while sink.rotations() == 0 {
            sink.write(line.as_bytes()).await.unwrap();
            wrote += 1;
            assert!(wrote < 100, "rotation never triggered");
        }

        let finalized = finals(dir.path());
        assert_eq!(finalized.len(), 1);
        assert!(fs::metadata(&finalized[0]).unwrap().len() >= 500);
        assert_eq!(actives(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn rotates_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(&cfg(dir.path(), 1_000_000, 3600), "i").unwrap();
        sink.write(b"{\"a\":1}\n").await.unwrap();

        // Force the age check rather than waiting.
        sink.rotation_interval = Duration::ZERO;
        sink.tick().await.unwrap();

        assert_eq!(sink.rotations(), 1);
        assert_eq!(finals(dir.path()).len(), 1);
        assert_eq!(actives(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn rapid_rotations_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(&cfg(dir.path(), 10, 3600), "i").unwrap();

        for _ in 0..3 {
            sink.write(b"{\"xxxxxxxxxxxxxxxx\":1}\n").await.unwrap();
        }

        // Every write crossed the threshold: three finalized files, all
        // within the same wall-clock second.
        assert_eq!(finals(dir.path()).len(), 3);
    }

    #[tokio::test]
    async fn close_finalizes_nonempty_and_discards_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(&cfg(dir.path(), 1_000_000, 3600), "i").unwrap();
        sink.write(b"{\"a\":1}\n").await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(finals(dir.path()).len(), 1);
        assert!(actives(dir.path()).is_empty());

        // A sink that never wrote leaves nothing behind.
        let mut empty = FileSink::new(&cfg(dir.path(), 1_000_000, 3600), "i").unwrap();
        empty.close().await.unwrap();
        assert_eq!(finals(dir.path()).len(), 1);
        assert!(actives(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn finalized_content_is_byte_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(&cfg(dir.path(), 1_000_000, 3600), "i").unwrap();
        sink.write(b"{\"n\":1}\n").await.unwrap();
        sink.write(b"{\"n\":2}\n").await.unwrap();
        sink.close().await.unwrap();

        let content = fs::read_to_string(&finals(dir.path())[0]).unwrap();
        assert_eq!(content, "{\"n\":1}\n{\"n\":2}\n");
    }

    #[tokio::test]
    async fn recovery_finalizes_complete_leftover() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.ndjson.active"), "{\"n\":1}\n{\"n\":2}\n").unwrap();

        let sink = FileSink::new(&cfg(dir.path(), 1_000_000, 3600), "i").unwrap();
        drop(sink);

        let recovered = dir.path().join("old.ndjson");
        assert!(recovered.exists());
        assert_eq!(fs::read_to_string(recovered).unwrap(), "{\"n\":1}\n{\"n\":2}\n");
    }

    #[tokio::test]
    async fn recovery_truncates_torn_last_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("torn.ndjson.active"), "{\"n\":1}\n{\"n\":2").unwrap();

        let _sink = FileSink::new(&cfg(dir.path(), 1_000_000, 3600), "i").unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("torn.ndjson")).unwrap(),
            "{\"n\":1}\n"
        );
    }

    #[tokio::test]
    async fn recovery_removes_files_without_a_complete_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("empty.ndjson.active"), "").unwrap();
        fs::write(dir.path().join("noline.ndjson.active"), "{\"n\":").unwrap();

        let _sink = FileSink::new(&cfg(dir.path(), 1_000_000, 3600), "i").unwrap();

        assert!(!dir.path().join("empty.ndjson").exists());
        assert!(!dir.path().join("noline.ndjson").exists());
        assert!(!dir.path().join("empty.ndjson.active").exists());
        assert!(!dir.path().join("noline.ndjson.active").exists());
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.ndjson.active"), "{\"n\":1}\n").unwrap();

        recover_leftovers(dir.path()).unwrap();
        recover_leftovers(dir.path()).unwrap();

        assert!(dir.path().join("old.ndjson").exists());
        assert!(!dir.path().join("old.ndjson.active").exists());
    }

    #[tokio::test]
    async fn recovery_does_not_touch_finalized_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("done.ndjson"), "{\"n\":1}\n").unwrap();

        recover_leftovers(dir.path()).unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("done.ndjson")).unwrap(),
            "{\"n\":1}\n"
        );
    }

    #[tokio::test]
    async fn missing_parent_directory_is_fatal() {
        // create_dir_all succeeds for nested paths, so point at a file.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a dir").unwrap();

        let err = FileSink::new(&cfg(&blocker, 1_000_000, 3600), "i").unwrap_err();
        assert!(matches!(err, SubclientError::OutputDir { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn sanitizes_instance_ids() {
        assert_eq!(sanitize_instance_id("writer-01"), "writer-01");
        assert_eq!(sanitize_instance_id("writer_01"), "writer_01");
        assert_eq!(sanitize_instance_id("w/r:t*r 1"), "w-r-t-r-1");
        assert_eq!(sanitize_instance_id("ünïcode"), "-n-code");
    }
}
