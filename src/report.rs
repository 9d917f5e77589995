use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters owned by a single worker (or the collection phase) for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatistics {
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub skipped: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Relative paths of failed items, in processing order.
    pub failures: Vec<String>,
}

impl RunStatistics {
    pub fn started() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn record_success(&mut self) {
        self.total += 1;
        self.success += 1;
    }

    pub fn record_skip(&mut self) {
        self.total += 1;
        self.skipped += 1;
    }

    pub fn record_error(&mut self, relative_path: impl Into<String>) {
        self.total += 1;
        self.error += 1;
        self.failures.push(relative_path.into());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub verdict: Verdict,
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub skipped: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failures: Vec<String>,
    pub bytes_attempted: u64,
    pub elapsed_seconds: f64,
    pub throughput_bytes_per_sec: Option<f64>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }

    /// Attaches throughput over the dispatch span. No rate is reported for a zero-length span.
    pub fn with_throughput(mut self, bytes_attempted: u64, elapsed: Duration) -> Self {
        let seconds = elapsed.as_secs_f64();
        self.bytes_attempted = bytes_attempted;
        self.elapsed_seconds = seconds;
        self.throughput_bytes_per_sec = (seconds > 0.0).then(|| bytes_attempted as f64 / seconds);
        self
    }
}

/// Combines per-worker statistics. Pure: no clock reads and no I/O.
pub fn merge(statistics: &[RunStatistics]) -> JobReport {
    let mut total = 0;
    let mut success = 0;
    let mut error = 0;
    let mut skipped = 0;
    let mut failures = Vec::new();
    for stats in statistics {
        total += stats.total;
        success += stats.success;
        error += stats.error;
        skipped += stats.skipped;
        failures.extend(stats.failures.iter().cloned());
    }
    JobReport {
        verdict: if error == 0 {
            Verdict::Success
        } else {
            Verdict::Failed
        },
        total,
        success,
        error,
        skipped,
        started_at: statistics.iter().filter_map(|s| s.started_at).min(),
        finished_at: statistics.iter().filter_map(|s| s.finished_at).max(),
        failures,
        bytes_attempted: 0,
        elapsed_seconds: 0.0,
        throughput_bytes_per_sec: None,
    }
}
