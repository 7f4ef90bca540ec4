//! One invocation of the tool: load, validate, then run every job in order.

use crate::config::{BackupConfig, BackupJob, ConfigLoader, Defaults};
use crate::executor::counters::JobSummary;
use crate::executor::rehydrate::DEFAULT_POLL_INTERVAL;
use crate::executor::{EngineOptions, JobPlan, SyncEngine};
use crate::fs::walker::discover;
use crate::storage::key::{Clock, SystemClock};
use crate::storage::StoreFactory;
use crate::utils::{Result, SyncError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    /// Force dry-run regardless of the config file
    pub dry_run_override: bool,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    JobFailed,
    ConfigError,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            RunStatus::Success => 0,
            RunStatus::JobFailed => 1,
            RunStatus::ConfigError => 2,
            RunStatus::Cancelled => 130,
        }
    }
}

pub struct Runner {
    factory: Arc<dyn StoreFactory>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl Runner {
    pub fn new(factory: Arc<dyn StoreFactory>) -> Self {
        Self {
            factory,
            clock: Arc::new(SystemClock),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Interval between status polls while an archived target thaws
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn run(
        &self,
        loader: &dyn ConfigLoader,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> RunStatus {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        self.run_inner(loader, options, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        loader: &dyn ConfigLoader,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> RunStatus {
        info!(config = %options.config_path.display(), "Loading configuration");

        let mut config = match loader.load(&options.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                return RunStatus::ConfigError;
            }
        };
        if options.dry_run_override {
            config.defaults.dry_run = true;
        }
        if let Err(e) = config.validate() {
            error!("Invalid configuration: {}", e);
            return RunStatus::ConfigError;
        }

        match self.run_jobs(&config, &cancel).await {
            Ok(_) if cancel.is_cancelled() => {
                warn!("Run cancelled");
                RunStatus::Cancelled
            }
            Ok(summaries) => {
                let errors: usize = summaries.iter().map(|s| s.errors).sum();
                info!(jobs = summaries.len(), file_errors = errors, "Run complete");
                RunStatus::Success
            }
            Err(SyncError::Cancelled) => {
                warn!("Run cancelled");
                RunStatus::Cancelled
            }
            Err(e) if e.is_config() => {
                error!("Invalid configuration: {}", e);
                RunStatus::ConfigError
            }
            Err(e) => {
                error!("Backup run failed: {}", e);
                RunStatus::JobFailed
            }
        }
    }

    /// Run the jobs of an already validated config, one after another.
    ///
    /// The first job that fails outright stops the run; per-file errors do not.
    pub async fn run_jobs(
        &self,
        config: &BackupConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<JobSummary>> {
        if config.jobs.is_empty() {
            warn!("No jobs found in config.");
            return Ok(Vec::new());
        }

        let mut summaries = Vec::with_capacity(config.jobs.len());
        for job in &config.jobs {
            if cancel.is_cancelled() {
                break;
            }
            let summary = self
                .run_job(job, &config.defaults, cancel)
                .instrument(info_span!("job", job = %job.name))
                .await
                .inspect_err(|e| {
                    if !e.is_cancelled() {
                        error!(job = %job.name, "Job failed: {}", e);
                    }
                })?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    async fn run_job(
        &self,
        job: &BackupJob,
        defaults: &Defaults,
        cancel: &CancellationToken,
    ) -> Result<JobSummary> {
        let store = self.factory.create(&job.destination)?;
        info!(job = %job.name, destination = %store.describe(), "Preparing destination");
        store.ensure_ready(cancel).await?;

        let source = job.source.clone();
        let files = tokio::task::spawn_blocking(move || discover(&source)).await??;
        if files.is_empty() {
            warn!(job = %job.name, "No files matched include/exclude patterns");
            return Ok(JobSummary::empty(job.name.clone()));
        }

        let engine = SyncEngine::new(
            store,
            EngineOptions {
                concurrency: defaults.effective_concurrency(),
                dry_run: defaults.dry_run,
                rehydrate_poll_interval: self.poll_interval,
            },
        )
        .with_clock(Arc::clone(&self.clock));

        let plan = JobPlan {
            name: job.name.clone(),
            files,
            prefix: job.destination.prefix().map(str::to_string),
            tier: job.effective_tier(defaults),
        };
        Ok(engine.run_job(plan, cancel).await)
    }
}
