//! Size-rotated log file writer.
//!
//! Off the data path: this backs the optional `logging.file` sink, not the
//! NDJSON output. Rotation follows the same spirit as the record writer —
//! a size threshold, then rename — but with numbered backups
//! (`app.log.1` … `app.log.N`, highest is oldest) instead of timestamped
//! finalized files.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

struct RollingFile {
    path: PathBuf,
    max_size_bytes: u64,
    backup_count: u32,
    file: File,
    written: u64,
}

impl RollingFile {
    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn numbered(&self, n: u32) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(format!(".{n}"));
        PathBuf::from(os)
    }

    /// Shift backups up by one, move the live file to `.1`, reopen.
    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.backup_count == 0 {
            // No backups requested: start the live file over.
            self.file = File::create(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        let _ = fs::remove_file(self.numbered(self.backup_count));
        for n in (1..self.backup_count).rev() {
            let from = self.numbered(n);
            if from.exists() {
                fs::rename(&from, self.numbered(n + 1))?;
            }
        }
        fs::rename(&self.path, self.numbered(1))?;

        self.file = Self::open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn write_line(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size_bytes {
            self.roll()?;
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }
}

/// Shareable handle to a size-rotated log file.
#[derive(Clone)]
pub struct RollingFileWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl RollingFileWriter {
    /// Open (creating parent directories) a rolling writer.
    pub fn new(path: &Path, max_size_bytes: u64, backup_count: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = RollingFile::open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile {
                path: path.to_path_buf(),
                max_size_bytes,
                backup_count,
                file,
                written,
            })),
        })
    }
}

impl io::Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_line(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for RollingFileWriter {
    type Writer = RollingFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
