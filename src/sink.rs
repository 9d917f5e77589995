//! Per-worker failure logs.
//!
//! Every worker owns one [`ErrorSink`]. Nothing is shared while items are
//! processed; the [`SinkFactory`] concatenates the workers' output in worker
//! order once all of them have returned.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

use crate::error::DmeError;

pub trait ErrorSink: Send {
    /// Full failure detail for the error log.
    fn log_error(&mut self, item: &str, detail: &str) -> Result<(), DmeError>;
    /// One replayable line: the item's path relative to the scan root.
    fn record_failure(&mut self, relative_path: &str) -> Result<(), DmeError>;
    fn flush(&mut self) -> Result<(), DmeError>;
}

/// Where the merged failure output ended up, if anything was written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkPaths {
    pub error_log: Option<PathBuf>,
    pub failed_records: Option<PathBuf>,
}

pub trait SinkFactory: Send + Sync {
    fn create(&self, worker: usize) -> Result<Box<dyn ErrorSink>, DmeError>;
    /// Flushes the returned sinks and merges the output of every sink created,
    /// in worker order. Sinks of workers that never returned may be missing.
    fn finalize(&self, sinks: Vec<Box<dyn ErrorSink>>) -> Result<SinkPaths, DmeError>;
}

pub struct FileErrorSink {
    log_path: PathBuf,
    record_path: PathBuf,
    log: Option<BufWriter<File>>,
    records: Option<BufWriter<File>>,
}

impl FileErrorSink {
    fn new(log_path: PathBuf, record_path: PathBuf) -> Self {
        Self {
            log_path,
            record_path,
            log: None,
            records: None,
        }
    }
}

fn open_lazily<'a>(
    slot: &'a mut Option<BufWriter<File>>,
    path: &Path,
) -> Result<&'a mut BufWriter<File>, DmeError> {
    if slot.is_none() {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| DmeError::Filesystem(format!("{}: {err}", path.display())))?;
        *slot = Some(BufWriter::new(file));
    }
    slot.as_mut()
        .ok_or_else(|| DmeError::Filesystem(format!("{} not open", path.display())))
}

impl ErrorSink for FileErrorSink {
    fn log_error(&mut self, item: &str, detail: &str) -> Result<(), DmeError> {
        let writer = open_lazily(&mut self.log, &self.log_path)?;
        writeln!(writer, "{} | {item} | {detail}", Utc::now().to_rfc3339())
            .map_err(|err| DmeError::Filesystem(err.to_string()))
    }

    fn record_failure(&mut self, relative_path: &str) -> Result<(), DmeError> {
        let writer = open_lazily(&mut self.records, &self.record_path)?;
        writeln!(writer, "{relative_path}").map_err(|err| DmeError::Filesystem(err.to_string()))
    }

    fn flush(&mut self) -> Result<(), DmeError> {
        for writer in [self.log.as_mut(), self.records.as_mut()].into_iter().flatten() {
            writer
                .flush()
                .map_err(|err| DmeError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }
}

/// Writes per-worker files under `dir`; file names match the scan's tool-log exclude.
pub struct FileSinkFactory {
    dir: PathBuf,
    run_id: String,
    created: Mutex<Vec<usize>>,
}

impl FileSinkFactory {
    pub fn new(dir: &Path) -> Result<Self, DmeError> {
        fs::create_dir_all(dir)
            .map_err(|err| DmeError::Filesystem(format!("{}: {err}", dir.display())))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            run_id: Utc::now().format("%Y%m%d-%H%M%S").to_string(),
            created: Mutex::new(Vec::new()),
        })
    }

    fn worker_paths(&self, worker: usize) -> (PathBuf, PathBuf) {
        (
            self.dir
                .join(format!("dme-upload-{}-worker-{worker}-errors.log", self.run_id)),
            self.dir
                .join(format!("dme-upload-{}-worker-{worker}-records.log", self.run_id)),
        )
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.dir.join(format!("dme-upload-{}-errors.log", self.run_id))
    }

    pub fn failed_records_path(&self) -> PathBuf {
        self.dir.join(format!("dme-upload-{}-failed.log", self.run_id))
    }
}

impl SinkFactory for FileSinkFactory {
    fn create(&self, worker: usize) -> Result<Box<dyn ErrorSink>, DmeError> {
        let (log, records) = self.worker_paths(worker);
        self.created
            .lock()
            .map_err(|_| DmeError::Filesystem("sink registry poisoned".to_string()))?
            .push(worker);
        Ok(Box::new(FileErrorSink::new(log, records)))
    }

    fn finalize(&self, sinks: Vec<Box<dyn ErrorSink>>) -> Result<SinkPaths, DmeError> {
        for mut sink in sinks {
            sink.flush()?;
        }

        let mut workers = self
            .created
            .lock()
            .map_err(|_| DmeError::Filesystem("sink registry poisoned".to_string()))?
            .clone();
        workers.sort_unstable();
        workers.dedup();
        let mut logs = Vec::with_capacity(workers.len());
        let mut records = Vec::with_capacity(workers.len());
        for worker in workers {
            let (log, record) = self.worker_paths(worker);
            logs.push(log);
            records.push(record);
        }
        Ok(SinkPaths {
            error_log: concatenate(&logs, &self.error_log_path())?,
            failed_records: concatenate(&records, &self.failed_records_path())?,
        })
    }
}

/// Appends the existing `parts` to `target` in order and removes them.
fn concatenate(parts: &[PathBuf], target: &Path) -> Result<Option<PathBuf>, DmeError> {
    let existing: Vec<&PathBuf> = parts.iter().filter(|part| part.exists()).collect();
    if existing.is_empty() {
        return Ok(None);
    }
    let map = |err: io::Error| DmeError::Filesystem(format!("{}: {err}", target.display()));
    let mut out = BufWriter::new(File::create(target).map_err(map)?);
    for part in existing {
        let mut input = File::open(part).map_err(map)?;
        io::copy(&mut input, &mut out).map_err(map)?;
        fs::remove_file(part).map_err(map)?;
    }
    out.flush().map_err(map)?;
    Ok(Some(target.to_path_buf()))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryLog {
    pub errors: Vec<(String, String)>,
    pub records: Vec<String>,
}

/// Buffers in the worker and publishes to a shared [`MemoryLog`] on flush.
pub struct MemoryErrorSink {
    local: MemoryLog,
    shared: Arc<Mutex<MemoryLog>>,
}

impl ErrorSink for MemoryErrorSink {
    fn log_error(&mut self, item: &str, detail: &str) -> Result<(), DmeError> {
        self.local
            .errors
            .push((item.to_string(), detail.to_string()));
        Ok(())
    }

    fn record_failure(&mut self, relative_path: &str) -> Result<(), DmeError> {
        self.local.records.push(relative_path.to_string());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DmeError> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| DmeError::Filesystem("memory sink poisoned".to_string()))?;
        shared.errors.append(&mut self.local.errors);
        shared.records.append(&mut self.local.records);
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemorySinkFactory {
    shared: Arc<Mutex<MemoryLog>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MemoryLog {
        self.shared
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn create(&self, _worker: usize) -> Result<Box<dyn ErrorSink>, DmeError> {
        Ok(Box::new(MemoryErrorSink {
            local: MemoryLog::default(),
            shared: self.shared.clone(),
        }))
    }

    fn finalize(&self, sinks: Vec<Box<dyn ErrorSink>>) -> Result<SinkPaths, DmeError> {
        for mut sink in sinks {
            sink.flush()?;
        }
        Ok(SinkPaths::default())
    }
}
