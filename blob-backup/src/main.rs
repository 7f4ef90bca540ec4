//! Blob Backup - Main entry point
//!
//! Runs every job of a configuration file once and exits.

use anyhow::Result;
use blob_backup::shutdown::ShutdownCoordinator;
use blob_backup::storage::azure::AzureStoreFactory;
use blob_backup::{utils, FileConfigLoader, RunOptions, RunStatus, Runner};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the backup configuration (JSON, or TOML with a .toml extension)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log decisions without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Directory for daily log files (default: $BLOB_BACKUP_LOGDIR, then
    /// /var/log/blob-backup, then ~/.local/state/blob-backup/logs)
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let Some(config_path) = args.config else {
        println!("Usage: blob-backup --config <config.json> [--dry-run]");
        return Ok(ExitCode::SUCCESS);
    };

    let log_dir = utils::logger::resolve_log_dir(args.log_dir);
    utils::logger::init(&args.log_level, log_dir.as_deref())?;

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!(
        "Starting blob-backup v{} on {}",
        env!("CARGO_PKG_VERSION"),
        host
    );
    if let Some(dir) = &log_dir {
        tracing::debug!("Writing logs to {}", dir.display());
    }

    let cancel = CancellationToken::new();
    let signal_listener = ShutdownCoordinator::new(cancel.clone()).spawn();

    let factory = match AzureStoreFactory::from_env() {
        Ok(factory) => factory,
        Err(e) => {
            tracing::error!("Failed to initialize storage client: {}", e);
            return Ok(ExitCode::from(RunStatus::JobFailed.exit_code()));
        }
    };

    let options = RunOptions {
        config_path,
        dry_run_override: args.dry_run,
    };
    let status = Runner::new(Arc::new(factory))
        .run(&FileConfigLoader, &options, cancel.clone())
        .await;

    // Release the signal listener
    signal_listener.stop().await;

    tracing::info!(?status, "Exiting");
    Ok(ExitCode::from(status.exit_code()))
}
