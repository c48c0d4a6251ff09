//! Container log pump: main process output to Docker json-file logs.

use andock_core::error::{AndockError, Result};
use andock_core::exec::ExecOutput;
use andock_core::log::{LogConfig, LogDriver, LogEntry};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Start a background task that drains `output` into the container's
/// json-file log. With the `none` driver output is drained and dropped.
pub fn spawn_log_pump(
    mut output: mpsc::Receiver<ExecOutput>,
    log_path: PathBuf,
    config: LogConfig,
) -> JoinHandle<()> {
    match config.driver {
        LogDriver::None => tokio::spawn(async move { while output.recv().await.is_some() {} }),
        LogDriver::JsonFile => {
            let max_size = config.max_size();
            let max_file = config.max_file();
            tokio::task::spawn_blocking(move || {
                let mut writer = match RotatingWriter::new(&log_path, max_size, max_file) {
                    Ok(w) => Some(w),
                    Err(e) => {
                        tracing::warn!(path = %log_path.display(), error = %e, "Failed to open container log");
                        None
                    }
                };

                while let Some(chunk) = output.blocking_recv() {
                    let Some(ref mut writer) = writer else {
                        continue;
                    };
                    let line = String::from_utf8_lossy(&chunk.data);
                    let entry = LogEntry::now(chunk.stream, &line);
                    if let Ok(json) = serde_json::to_string(&entry) {
                        if let Err(e) = writer.write_line(&json) {
                            tracing::warn!(path = %log_path.display(), error = %e, "Failed to write container log");
                        }
                    }
                }
            })
        }
    }
}

/// Path to a container's json-file log.
pub fn json_log_path(container_dir: &Path, id: &str) -> PathBuf {
    container_dir.join(format!("{}-json.log", id))
}

/// Read log entries, oldest first, across rotated files. `tail` keeps only
/// the last N entries.
pub fn read_logs(path: &Path, max_file: u32, tail: Option<usize>) -> Result<Vec<LogEntry>> {
    let mut files: Vec<PathBuf> = (1..=max_file)
        .rev()
        .map(|i| rotated_path(path, i))
        .collect();
    files.push(path.to_path_buf());

    let mut entries = Vec::new();
    for file in files.iter().filter(|f| f.exists()) {
        let reader = std::fs::File::open(file)
            .map(BufReader::new)
            .map_err(|e| AndockError::Disk(format!("Failed to open {}: {}", file.display(), e)))?;
        for line in reader.lines() {
            let line = line
                .map_err(|e| AndockError::Disk(format!("Failed to read {}: {}", file.display(), e)))?;
            // A partially written last line is skipped
            if let Ok(entry) = serde_json::from_str::<LogEntry>(&line) {
                entries.push(entry);
            }
        }
    }

    if let Some(n) = tail {
        let skip = entries.len().saturating_sub(n);
        entries.drain(..skip);
    }
    Ok(entries)
}

/// A file writer that rotates when the file exceeds `max_size`.
struct RotatingWriter {
    path: PathBuf,
    file: std::fs::File,
    written: u64,
    max_size: u64,
    max_file: u32,
}

impl RotatingWriter {
    fn new(path: &Path, max_size: u64, max_file: u32) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_size,
            max_file,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let bytes = format!("{}\n", line);
        self.file.write_all(bytes.as_bytes())?;
        self.file.flush()?;
        self.written += bytes.len() as u64;

        if self.written >= self.max_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        if self.max_file == 0 {
            self.file.set_len(0)?;
            self.written = 0;
            return Ok(());
        }

        // .1 -> .2 and so on; the oldest falls off the end
        let oldest = rotated_path(&self.path, self.max_file);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for i in (1..self.max_file).rev() {
            let from = rotated_path(&self.path, i);
            if from.exists() {
                std::fs::rename(&from, rotated_path(&self.path, i + 1))?;
            }
        }
        std::fs::rename(&self.path, rotated_path(&self.path, 1))?;

        self.file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

/// `{id}-json.log` -> `{id}-json.log.1`
fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let mut p = base.as_os_str().to_owned();
    p.push(format!(".{}", index));
    PathBuf::from(p)
}
