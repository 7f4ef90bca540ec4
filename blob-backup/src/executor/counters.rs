//! Per-job outcome counters and the summary built from them.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How a single file ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Uploaded,
    Skipped,
    DryRun,
    Error,
    Cancelled,
}

/// Shared between every unit of one job
#[derive(Debug, Default)]
pub struct JobRunCounters {
    uploaded: AtomicUsize,
    skipped: AtomicUsize,
    dry_run: AtomicUsize,
    errors: AtomicUsize,
}

impl JobRunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelled units leave every counter untouched.
    pub fn record(&self, outcome: FileOutcome) {
        let counter = match outcome {
            FileOutcome::Uploaded => &self.uploaded,
            FileOutcome::Skipped => &self.skipped,
            FileOutcome::DryRun => &self.dry_run,
            FileOutcome::Error => &self.errors,
            FileOutcome::Cancelled => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> usize {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn dry_run(&self) -> usize {
        self.dry_run.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> usize {
        self.uploaded() + self.skipped() + self.dry_run() + self.errors()
    }
}

/// Final result of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub name: String,
    pub discovered: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub dry_run: usize,
    pub errors: usize,
    pub cancelled: bool,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl JobSummary {
    pub fn from_counters(
        name: impl Into<String>,
        discovered: usize,
        counters: &JobRunCounters,
        cancelled: bool,
        elapsed: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            discovered,
            uploaded: counters.uploaded(),
            skipped: counters.skipped(),
            dry_run: counters.dry_run(),
            errors: counters.errors(),
            cancelled,
            elapsed,
        }
    }

    /// Summary for a job that matched no files
    pub fn empty(name: impl Into<String>) -> Self {
        Self::from_counters(name, 0, &JobRunCounters::new(), false, Duration::ZERO)
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
