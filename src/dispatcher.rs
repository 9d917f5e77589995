//! Orchestration of one bulk run.
//!
//! ```text
//! Scanning -> Confirming -> RegisteringCollections -> DispatchingFiles
//!          -> AwaitingWorkers -> Merging -> Done
//! ```
//!
//! Collections are registered serially in path order so every parent exists
//! before its children. Files are then dealt round-robin onto N bounded
//! queues, one per worker thread; closing the queues ends the workers.
//! Any fatal error moves the run to `Failed`.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::domain::{PathEntry, RunCriteria, WorkItem};
use crate::error::DmeError;
use crate::glob::PathFilter;
use crate::registrar::{Registrar, RegistrationOutcome};
use crate::report::{JobReport, RunStatistics, merge};
use crate::scanner::{PathScanner, total_file_bytes};
use crate::sink::{ErrorSink, SinkFactory, SinkPaths};

const QUEUE_CAPACITY: usize = 64;

/// Cooperative stop signal, checked between items and between parts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Scanning,
    Confirming,
    RegisteringCollections,
    DispatchingFiles,
    AwaitingWorkers,
    Merging,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub source: PathBuf,
    pub destination: String,
    pub directories: usize,
    pub files: usize,
    pub total_bytes: u64,
}

impl ScanSummary {
    pub fn from_entries(source: PathBuf, destination: String, entries: &[PathEntry]) -> Self {
        let directories = entries.iter().filter(|e| e.is_directory).count();
        Self {
            source,
            destination,
            directories,
            files: entries.len() - directories,
            total_bytes: total_file_bytes(entries),
        }
    }
}

pub trait Confirmer: Send + Sync {
    fn confirm(&self, summary: &ScanSummary) -> Result<bool, DmeError>;
}

/// Fixed answer, for unattended runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl Confirmer for AutoConfirm {
    fn confirm(&self, _summary: &ScanSummary) -> Result<bool, DmeError> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, summary: &ScanSummary) -> Result<bool, DmeError> {
        let mut stderr = io::stderr();
        write!(
            stderr,
            "About to register {} directories and {} files ({} bytes) from {} into {}.\n\
             Are you sure you want to register this directory? (Y/N): ",
            summary.directories,
            summary.files,
            summary.total_bytes,
            summary.source.display(),
            summary.destination
        )
        .and_then(|_| stderr.flush())
        .map_err(|err| DmeError::Confirmation(err.to_string()))?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|err| DmeError::Confirmation(err.to_string()))?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    NothingToDo,
    Declined,
    TestRun {
        summary: ScanSummary,
        entries: Vec<PathEntry>,
    },
    Completed {
        report: JobReport,
        logs: SinkPaths,
        cancelled: bool,
    },
}

pub struct BatchDispatcher {
    registrar: Registrar,
    scanner: PathScanner,
    sinks: Arc<dyn SinkFactory>,
    confirmer: Arc<dyn Confirmer>,
    cancel: CancelFlag,
    source: PathBuf,
    file_list: Option<PathBuf>,
    criteria: Arc<RunCriteria>,
    threads: usize,
    confirm: bool,
    test_run: bool,
    state: RunState,
}

impl BatchDispatcher {
    pub fn new(
        config: &RunConfig,
        registrar: Registrar,
        sinks: Arc<dyn SinkFactory>,
        confirmer: Arc<dyn Confirmer>,
        cancel: CancelFlag,
    ) -> Result<Self, DmeError> {
        let filter = PathFilter::for_scan(
            config.include_patterns.clone(),
            config.exclude_patterns.clone(),
        )?;
        Ok(Self {
            registrar,
            scanner: PathScanner::new(filter),
            sinks,
            confirmer,
            cancel,
            source: config.source.clone(),
            file_list: config.file_list.clone(),
            criteria: Arc::new(config.criteria.clone()),
            threads: config.threads.max(1),
            confirm: config.confirm,
            test_run: config.test_run,
            state: RunState::Scanning,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run(&mut self) -> Result<RunOutcome, DmeError> {
        let result = self.execute();
        match &result {
            Ok(_) => self.transition(RunState::Done),
            Err(err) => {
                error!(error = %err, state = ?self.state, "run failed");
                self.transition(RunState::Failed);
            }
        }
        result
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    fn execute(&mut self) -> Result<RunOutcome, DmeError> {
        self.transition(RunState::Scanning);
        let entries = match &self.file_list {
            Some(list) => self.scanner.scan_file_list(&self.source, list)?,
            None => self.scanner.scan(&self.source)?,
        };
        if entries.is_empty() {
            info!(source = %self.source.display(), "nothing to register");
            return Ok(RunOutcome::NothingToDo);
        }

        let summary = ScanSummary::from_entries(
            self.source.clone(),
            self.criteria.destination_base_path.clone(),
            &entries,
        );
        info!(
            directories = summary.directories,
            files = summary.files,
            total_bytes = summary.total_bytes,
            "inventory ready"
        );
        if self.test_run {
            return Ok(RunOutcome::TestRun { summary, entries });
        }

        if self.confirm {
            self.transition(RunState::Confirming);
            if !self.confirmer.confirm(&summary)? {
                info!("registration declined");
                return Ok(RunOutcome::Declined);
            }
        }

        let (directories, files): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|entry| entry.is_directory);

        self.transition(RunState::RegisteringCollections);
        let collection_stats = self.register_collections(directories)?;

        self.transition(RunState::DispatchingFiles);
        let started = Instant::now();
        let bytes_attempted = total_file_bytes(&files);
        let handles = self.dispatch_files(files)?;

        self.transition(RunState::AwaitingWorkers);
        let mut statistics = vec![collection_stats];
        let mut sinks: Vec<Box<dyn ErrorSink>> = Vec::with_capacity(handles.len());
        let mut panicked = None;
        for (worker, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok((stats, sink)) => {
                    statistics.push(stats);
                    sinks.push(sink);
                }
                Err(_) => {
                    error!(worker, "worker panicked");
                    panicked.get_or_insert(worker);
                }
            }
        }
        let elapsed = started.elapsed();

        self.transition(RunState::Merging);
        let logs = self.sinks.finalize(sinks)?;
        if let Some(worker) = panicked {
            return Err(DmeError::WorkerPanicked(worker));
        }
        let report = merge(&statistics).with_throughput(bytes_attempted, elapsed);
        let cancelled = self.cancel.is_cancelled();
        info!(
            total = report.total,
            success = report.success,
            error = report.error,
            skipped = report.skipped,
            elapsed_seconds = report.elapsed_seconds,
            cancelled,
            "run finished"
        );
        Ok(RunOutcome::Completed {
            report,
            logs,
            cancelled,
        })
    }

    fn register_collections(&self, directories: Vec<PathEntry>) -> Result<RunStatistics, DmeError> {
        let mut stats = RunStatistics::started();
        for entry in directories {
            if self.cancel.is_cancelled() {
                return Err(DmeError::Cancelled);
            }
            let relative = entry.relative_path.to_string();
            let item = WorkItem::new(entry, self.criteria.clone());
            match self.registrar.register(&item) {
                Ok(RegistrationOutcome::Registered { .. }) => stats.record_success(),
                Ok(RegistrationOutcome::Skipped) => stats.record_skip(),
                Err(err) => {
                    let path = item
                        .archive_path()
                        .map(|p| p.to_string())
                        .unwrap_or(relative);
                    return Err(DmeError::CollectionRegistration {
                        path,
                        message: err.to_string(),
                    });
                }
            }
        }
        stats.finish();
        Ok(stats)
    }

    fn dispatch_files(
        &self,
        files: Vec<PathEntry>,
    ) -> Result<Vec<JoinHandle<(RunStatistics, Box<dyn ErrorSink>)>>, DmeError> {
        let mut senders: Vec<Sender<WorkItem>> = Vec::with_capacity(self.threads);
        let mut handles = Vec::with_capacity(self.threads);
        for worker in 0..self.threads {
            let (tx, rx) = bounded(QUEUE_CAPACITY);
            let sink = self.sinks.create(worker)?;
            let registrar = self.registrar.clone();
            let cancel = self.cancel.clone();
            let handle = thread::Builder::new()
                .name(format!("dme-worker-{worker}"))
                .spawn(move || run_worker(worker, rx, registrar, sink, cancel))
                .map_err(|err| DmeError::Filesystem(format!("failed to spawn worker: {err}")))?;
            senders.push(tx);
            handles.push(handle);
        }

        for (index, entry) in files.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(dispatched = index, "cancelled, no further items dispatched");
                break;
            }
            let worker = index % senders.len();
            let item = WorkItem::new(entry, self.criteria.clone());
            if senders[worker].send(item).is_err() {
                warn!(worker, "worker queue closed early");
            }
        }
        drop(senders);
        Ok(handles)
    }
}

fn run_worker(
    worker: usize,
    queue: Receiver<WorkItem>,
    registrar: Registrar,
    mut sink: Box<dyn ErrorSink>,
    cancel: CancelFlag,
) -> (RunStatistics, Box<dyn ErrorSink>) {
    let mut stats = RunStatistics::started();
    for item in queue.iter() {
        if cancel.is_cancelled() {
            break;
        }
        let relative = item.entry.relative_path.to_string();
        match registrar.register(&item) {
            Ok(RegistrationOutcome::Registered { .. }) => stats.record_success(),
            Ok(RegistrationOutcome::Skipped) => stats.record_skip(),
            Err(err) => {
                let target = item
                    .archive_path()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|_| relative.clone());
                error!(worker, path = %relative, error = %err, "item failed");
                if let Err(sink_err) = sink.log_error(&target, &format!("{err:?}: {err}")) {
                    warn!(worker, error = %sink_err, "failed to write error log");
                }
                if let Err(sink_err) = sink.record_failure(&relative) {
                    warn!(worker, error = %sink_err, "failed to write failure record");
                }
                stats.record_error(relative);
            }
        }
    }
    stats.finish();
    debug!(
        worker,
        total = stats.total,
        success = stats.success,
        error = stats.error,
        "worker done"
    );
    (stats, sink)
}
