//! Sync engine - pushes one job's files to an object store.
//!
//! Every discovered file is an independent unit:
//! resolve key, look up the remote object, fingerprint, then skip, report a
//! dry run, or (after the archive gate) upload. Units run concurrently up to
//! the configured limit and never affect each other; a failing unit is
//! counted and logged while the rest of the job carries on.

pub mod counters;
pub mod rehydrate;

use crate::config::StorageTier;
use crate::fs::content_type::infer_content_type;
use crate::fs::fingerprint::{fingerprint_file_async, fingerprints_match};
use crate::fs::walker::DiscoveredFile;
use crate::storage::key::{resolve_key, Clock, SystemClock};
use crate::storage::{cancellable, ObjectBody, ObjectStore, StorageUploadOptions};
use crate::utils::{Result, SyncError};
use counters::{FileOutcome, JobRunCounters, JobSummary};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine tuning for one run
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound on units in flight, clamped into `1..=Semaphore::MAX_PERMITS`
    pub concurrency: usize,
    pub dry_run: bool,
    pub rehydrate_poll_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            dry_run: false,
            rehydrate_poll_interval: rehydrate::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Everything the engine needs to run one job
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub name: String,
    pub files: Vec<DiscoveredFile>,
    /// Key prefix template, expanded per file
    pub prefix: Option<String>,
    pub tier: StorageTier,
}

/// State shared by all units of a job
struct UnitContext {
    job: String,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    prefix: Option<String>,
    tier: StorageTier,
    dry_run: bool,
    poll_interval: Duration,
}

pub struct SyncEngine {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ObjectStore>, options: EngineOptions) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            options,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run every file of `plan` and wait for all of them.
    ///
    /// Cancellation stops scheduling new units and interrupts the ones in
    /// flight; whatever finished before is still reported.
    pub async fn run_job(&self, plan: JobPlan, cancel: &CancellationToken) -> JobSummary {
        let started = Instant::now();
        let discovered = plan.files.len();
        let limit = self.options.concurrency.clamp(1, Semaphore::MAX_PERMITS);

        info!(
            job = %plan.name,
            files = discovered,
            concurrency = limit,
            dry_run = self.options.dry_run,
            tier = %plan.tier,
            "Starting job"
        );

        let context = Arc::new(UnitContext {
            job: plan.name.clone(),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            prefix: plan.prefix,
            tier: plan.tier,
            dry_run: self.options.dry_run,
            poll_interval: self.options.rehydrate_poll_interval,
        });
        let counters = Arc::new(JobRunCounters::new());
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut units = JoinSet::new();

        for file in plan.files {
            if cancel.is_cancelled() {
                break;
            }

            // Permit is taken before the unit starts and moves into it
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(finished) = units.try_join_next() {
                reap(finished, &context.job, &counters);
            }

            let context = Arc::clone(&context);
            let counters = Arc::clone(&counters);
            let cancel = cancel.clone();
            units.spawn(async move {
                let _permit = permit;
                let outcome = process_file(&context, &file, &cancel).await;
                counters.record(outcome);
            });
        }

        while let Some(finished) = units.join_next().await {
            reap(finished, &context.job, &counters);
        }

        let cancelled = cancel.is_cancelled();
        let summary = JobSummary::from_counters(
            plan.name,
            discovered,
            &counters,
            cancelled,
            started.elapsed(),
        );

        if cancelled {
            warn!(
                job = %summary.name,
                completed = counters.completed(),
                discovered,
                "Job cancelled"
            );
        }
        info!(
            job = %summary.name,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Job finished: {}. Uploaded={}, Skipped={}, DryRuns={}, Errors={}",
            summary.name,
            summary.uploaded,
            summary.skipped,
            summary.dry_run,
            summary.errors
        );

        summary
    }
}

/// Account for a unit whose task ended; a panic counts as an error.
fn reap(finished: std::result::Result<(), JoinError>, job: &str, counters: &JobRunCounters) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!(job = %job, error = %e, "File unit panicked");
            counters.record(FileOutcome::Error);
        } else {
            debug!(job = %job, "File unit aborted");
        }
    }
}

async fn process_file(
    context: &UnitContext,
    file: &DiscoveredFile,
    cancel: &CancellationToken,
) -> FileOutcome {
    match sync_file(context, file, cancel).await {
        Ok(outcome) => outcome,
        Err(SyncError::Cancelled) => {
            debug!(job = %context.job, file = %file.relative_path, "Cancelled");
            FileOutcome::Cancelled
        }
        Err(e) => {
            error!(
                job = %context.job,
                path = %file.path.display(),
                error = %e,
                "Error processing {}",
                file.relative_path
            );
            FileOutcome::Error
        }
    }
}

async fn sync_file(
    context: &UnitContext,
    file: &DiscoveredFile,
    cancel: &CancellationToken,
) -> Result<FileOutcome> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let key = resolve_key(
        context.prefix.as_deref(),
        &file.relative_path,
        context.clock.now(),
    );
    let existing = context.store.try_get_info(&key, cancel).await?;
    let fingerprint = cancellable(cancel, fingerprint_file_async(file.path.clone())).await?;

    let remote = existing.as_ref().and_then(|info| info.fingerprint.as_deref());
    if remote.is_some_and(|remote| fingerprints_match(remote, &fingerprint)) {
        info!(job = %context.job, key = %key, "Skip unchanged {}", file.relative_path);
        return Ok(FileOutcome::Skipped);
    }

    if context.dry_run {
        info!(
            job = %context.job,
            "[DRY-RUN] Would upload {} -> {} (tier={})",
            file.relative_path,
            key,
            context.tier
        );
        return Ok(FileOutcome::DryRun);
    }

    let report = rehydrate::wait_until_writable(
        context.store.as_ref(),
        &key,
        existing.as_ref(),
        context.poll_interval,
        cancel,
    )
    .await?;
    if report.requested || report.polls > 0 {
        info!(job = %context.job, key = %key, polls = report.polls, "Target rehydrated");
    }

    let body = ObjectBody::from_file(&file.path).await?;
    let size = body.len();
    let options = StorageUploadOptions {
        tier: context.tier,
        fingerprint: Some(fingerprint),
        overwrite: true,
        content_type: infer_content_type(&file.path).map(str::to_string),
    };
    context.store.upload(&key, body, &options, cancel).await?;

    info!(
        job = %context.job,
        key = %key,
        bytes = size,
        tier = %context.tier,
        "Uploaded {}",
        file.relative_path
    );
    Ok(FileOutcome::Uploaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fingerprint::fingerprint_bytes;
    use crate::fs::walker::{walk_root, FileMatcher};
    use crate::storage::key::FixedClock;
    use crate::storage::memory::{MemoryObject, MemoryStore};
    use chrono::{TimeZone, Utc};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = temp_dir.path().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(full, content).unwrap();
        }
        temp_dir
    }

    fn plan(root: &Path, include: &[&str]) -> JobPlan {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let matcher = FileMatcher::new(&include, &[]).unwrap();
        JobPlan {
            name: "test-job".into(),
            files: walk_root(root, &matcher, false),
            prefix: None,
            tier: StorageTier::Cool,
        }
    }

    fn options(concurrency: usize, dry_run: bool) -> EngineOptions {
        EngineOptions {
            concurrency,
            dry_run,
            rehydrate_poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_fresh_destination_uploads_matching_files() {
        let dir = tree(&[
            ("a.txt", "alpha"),
            ("b.txt", "bravo"),
            ("c.txt", "charlie"),
            ("notes.md", "skip me"),
            ("nested/d.txt", "not top level"),
        ]);
        let store = Arc::new(MemoryStore::new("fresh"));
        let engine = SyncEngine::new(store.clone(), options(2, false));

        let summary = engine
            .run_job(plan(dir.path(), &["*.txt"]), &CancellationToken::new())
            .await;

        assert_eq!(summary.discovered, 3);
        assert_eq!(
            (summary.uploaded, summary.skipped, summary.dry_run, summary.errors),
            (3, 0, 0, 0)
        );
        assert!(!summary.cancelled);
        assert_eq!(store.keys(), vec!["a.txt", "b.txt", "c.txt"]);

        let stored = store.get("a.txt").unwrap();
        assert_eq!(stored.fingerprint.as_deref(), Some(fingerprint_bytes(b"alpha").as_str()));
        assert_eq!(stored.tier, StorageTier::Cool);
        assert_eq!(stored.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let dir = tree(&[("a.txt", "1"), ("sub/b.bin", "2"), ("sub/deep/c.log", "3")]);
        let store = Arc::new(MemoryStore::new("idempotent"));
        let engine = SyncEngine::new(store.clone(), options(4, false));
        let cancel = CancellationToken::new();

        let first = engine.run_job(plan(dir.path(), &["**/*"]), &cancel).await;
        assert_eq!(first.uploaded, 3);

        let second = engine.run_job(plan(dir.path(), &["**/*"]), &cancel).await;
        assert_eq!((second.uploaded, second.skipped, second.errors), (0, 3, 0));
        assert_eq!(store.upload_count(), 3);
    }

    #[tokio::test]
    async fn test_remote_fingerprint_compared_case_insensitively() {
        let dir = tree(&[("a.txt", "same")]);
        let store = Arc::new(MemoryStore::new("case"));
        store.insert(
            "a.txt",
            MemoryObject::new(
                &b"same"[..],
                Some(fingerprint_bytes(b"same").to_uppercase()),
                StorageTier::Hot,
            ),
        );
        let engine = SyncEngine::new(store.clone(), options(1, false));

        let summary = engine
            .run_job(plan(dir.path(), &["**/*"]), &CancellationToken::new())
            .await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(store.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let files: Vec<(String, String)> = (0..12)
            .map(|i| (format!("file{i:02}.txt"), format!("content {i}")))
            .collect();
        let refs: Vec<(&str, &str)> =
            files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        let dir = tree(&refs);

        let store = Arc::new(MemoryStore::new("bounded").with_latency(Duration::from_millis(20)));
        let engine = SyncEngine::new(store.clone(), options(3, false));

        let summary = engine
            .run_job(plan(dir.path(), &["**/*"]), &CancellationToken::new())
            .await;

        assert_eq!(summary.uploaded, 12);
        assert!(store.peak_concurrency() <= 3, "peak was {}", store.peak_concurrency());
        assert!(store.peak_concurrency() > 1);
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_runs() {
        let dir = tree(&[("a.txt", "x"), ("b.txt", "y")]);
        let store = Arc::new(MemoryStore::new("zero"));
        let engine = SyncEngine::new(store.clone(), options(0, false));

        let summary = engine
            .run_job(plan(dir.path(), &["**/*"]), &CancellationToken::new())
            .await;

        assert_eq!(summary.uploaded, 2);
        assert_eq!(store.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_huge_concurrency_is_clamped() {
        let dir = tree(&[("a.txt", "x"), ("b.txt", "y")]);
        let store = Arc::new(MemoryStore::new("huge"));
        let engine = SyncEngine::new(store.clone(), options(usize::MAX, false));

        let summary = engine
            .run_job(plan(dir.path(), &["**/*"]), &CancellationToken::new())
            .await;

        assert_eq!((summary.uploaded, summary.errors), (2, 0));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tree(&[("a.txt", "1"), ("b.txt", "2"), ("old.txt", "3")]);
        let store = Arc::new(MemoryStore::new("dry"));
        store.insert("old.txt", MemoryObject::new(&b"stale"[..], None, StorageTier::Archive));
        let engine = SyncEngine::new(store.clone(), options(2, true));

        let summary = engine
            .run_job(plan(dir.path(), &["**/*"]), &CancellationToken::new())
            .await;

        assert_eq!((summary.dry_run, summary.uploaded, summary.errors), (3, 0, 0));
        assert_eq!(store.upload_count(), 0);
        assert_eq!(store.rehydration_count(), 0);
        assert_eq!(store.keys(), vec!["old.txt"]);
        assert_eq!(store.get("old.txt").unwrap().tier, StorageTier::Archive);
    }

    #[tokio::test]
    async fn test_one_failure_is_isolated() {
        let dir = tree(&[("a.txt", "1"), ("b.txt", "2"), ("c.txt", "3")]);
        let store = Arc::new(MemoryStore::new("failing"));
        store.fail_uploads_to("b.txt");
        let engine = SyncEngine::new(store.clone(), options(2, false));

        let summary = engine
            .run_job(plan(dir.path(), &["**/*"]), &CancellationToken::new())
            .await;

        assert_eq!((summary.uploaded, summary.errors), (2, 1));
        assert!(summary.has_errors());
        assert_eq!(store.keys(), vec!["a.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_vanished_file_counts_as_error() {
        let dir = tree(&[("a.txt", "1"), ("gone.txt", "2")]);
        let job = plan(dir.path(), &["**/*"]);
        fs::remove_file(dir.path().join("gone.txt")).unwrap();

        let store = Arc::new(MemoryStore::new("vanished"));
        let engine = SyncEngine::new(store.clone(), options(2, false));
        let summary = engine.run_job(job, &CancellationToken::new()).await;

        assert_eq!((summary.uploaded, summary.errors), (1, 1));
    }

    #[tokio::test]
    async fn test_prefix_template_uses_clock() {
        let dir = tree(&[("a/b.txt", "nested")]);
        let store = Arc::new(MemoryStore::new("templated"));
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 5, 7, 9, 0, 0).unwrap());
        let engine =
            SyncEngine::new(store.clone(), options(1, false)).with_clock(Arc::new(clock));

        let mut job = plan(dir.path(), &["**/*"]);
        job.prefix = Some("backups/{yyyy}/{MM}".into());
        engine.run_job(job, &CancellationToken::new()).await;

        assert_eq!(store.keys(), vec!["backups/2024/05/a/b.txt"]);
    }

    #[tokio::test]
    async fn test_archived_target_is_rehydrated_before_upload() {
        let dir = tree(&[("cold.txt", "new content")]);
        let store = Arc::new(MemoryStore::new("archive").with_polls_to_thaw(3));
        store.insert(
            "cold.txt",
            MemoryObject::new(&b"old"[..], Some("outdated".into()), StorageTier::Archive),
        );
        let engine = SyncEngine::new(store.clone(), options(1, false));

        let mut job = plan(dir.path(), &["**/*"]);
        job.tier = StorageTier::Hot;
        let summary = engine.run_job(job, &CancellationToken::new()).await;

        assert_eq!((summary.uploaded, summary.errors), (1, 0));
        assert_eq!(store.rehydration_count(), 1);
        // initial lookup plus three status polls
        assert_eq!(store.info_requests(), 4);

        let stored = store.get("cold.txt").unwrap();
        assert_eq!(stored.data.as_ref(), b"new content");
        assert_eq!(stored.tier, StorageTier::Hot);
    }

    #[tokio::test]
    async fn test_ready_target_is_not_polled() {
        let dir = tree(&[("warm.txt", "v2")]);
        let store = Arc::new(MemoryStore::new("warm"));
        store.insert("warm.txt", MemoryObject::new(&b"v1"[..], None, StorageTier::Cool));
        let engine = SyncEngine::new(store.clone(), options(1, false));

        let summary = engine
            .run_job(plan(dir.path(), &["**/*"]), &CancellationToken::new())
            .await;

        assert_eq!(summary.uploaded, 1);
        assert_eq!(store.info_requests(), 1);
        assert_eq!(store.rehydration_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_does_nothing() {
        let dir = tree(&[("a.txt", "1"), ("b.txt", "2")]);
        let store = Arc::new(MemoryStore::new("cancelled"));
        let engine = SyncEngine::new(store.clone(), options(2, false));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = engine.run_job(plan(dir.path(), &["**/*"]), &cancel).await;

        assert!(summary.cancelled);
        assert_eq!(summary.discovered, 2);
        assert_eq!(
            (summary.uploaded, summary.skipped, summary.dry_run, summary.errors),
            (0, 0, 0, 0)
        );
        assert_eq!(store.info_requests(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_permit_wait() {
        let dir = tree(&[("a.txt", "1"), ("b.txt", "2"), ("c.txt", "3"), ("d.txt", "4")]);
        let store = Arc::new(MemoryStore::new("queued").with_latency(Duration::from_secs(30)));
        let engine = SyncEngine::new(store.clone(), options(1, false));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            engine.run_job(plan(dir.path(), &["**/*"]), &cancel),
        )
        .await
        .expect("run_job returns once cancelled");

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(summary.cancelled);
        assert_eq!(summary.discovered, 4);
        assert_eq!(
            (summary.uploaded, summary.skipped, summary.dry_run, summary.errors),
            (0, 0, 0, 0)
        );
        // only the unit holding the single permit ever reached the store
        assert_eq!(store.info_requests(), 1);
        assert_eq!(store.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_rehydration_wait() {
        let dir = tree(&[("stuck.txt", "new")]);
        let store = Arc::new(MemoryStore::new("stuck").with_polls_to_thaw(usize::MAX));
        store.insert("stuck.txt", MemoryObject::new(&b"old"[..], None, StorageTier::Archive));
        let engine = SyncEngine::new(store.clone(), options(1, false));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let summary = engine.run_job(plan(dir.path(), &["**/*"]), &cancel).await;

        assert!(summary.cancelled);
        assert_eq!((summary.uploaded, summary.errors), (0, 0));
        assert_eq!(store.upload_count(), 0);
        assert_eq!(store.get("stuck.txt").unwrap().tier, StorageTier::Archive);
    }
}
