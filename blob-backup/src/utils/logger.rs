//! Logging configuration using tracing.
//!
//! Events always go to stdout and are also appended to a per-day file
//! (`backup-YYYYMMDD.log`); older files beyond the retention limit are
//! removed. The directory comes from [`resolve_log_dir`].

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Number of daily log files kept in the log directory
pub const RETAINED_LOG_FILES: usize = 30;

const LOG_FILE_PREFIX: &str = "backup-";
const LOG_FILE_SUFFIX: &str = ".log";

/// Environment override for the log directory
pub const LOG_DIR_ENV: &str = "BLOB_BACKUP_LOGDIR";

const APP_DIR: &str = "blob-backup";
const SYSTEM_LOG_DIR: &str = "/var/log/blob-backup";

/// Initialize logging with the specified level and optional file sink.
///
/// A log directory that cannot be opened is reported on stderr and the run
/// continues with stdout only.
pub fn init(level: &str, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_dir.map(|dir| (dir, open_daily_log(dir))) {
        Some((dir, Ok(file))) => {
            if let Err(e) = prune_old_logs(dir, RETAINED_LOG_FILES) {
                eprintln!("Failed to prune old logs in {}: {}", dir.display(), e);
            }
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        Some((dir, Err(e))) => {
            eprintln!("Cannot write logs to {}: {}", dir.display(), e);
            None
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Pick the log directory.
///
/// Order: `explicit` (the `--log-dir` flag), then [`LOG_DIR_ENV`], then
/// `/var/log/blob-backup` when it is writable, then
/// `~/.local/state/blob-backup/logs`. `None` only when no home directory is
/// known.
pub fn resolve_log_dir(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir);
    }
    if let Some(dir) = std::env::var_os(LOG_DIR_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }

    let user_dir = dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("state")))
        .map(|state| state.join(APP_DIR).join("logs"));

    first_writable(&[PathBuf::from(SYSTEM_LOG_DIR)]).or(user_dir)
}

/// First candidate that can be created and written to
pub fn first_writable(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|dir| is_writable(dir)).cloned()
}

fn is_writable(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(".write_test");
    let written = fs::write(&marker, b"ok").is_ok();
    let _ = fs::remove_file(&marker);
    written
}

/// Path of today's log file inside `dir`
pub fn daily_log_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d");
    dir.join(format!("{LOG_FILE_PREFIX}{stamp}{LOG_FILE_SUFFIX}"))
}

/// Open (append) today's log file, creating the directory if needed
pub fn open_daily_log(dir: &Path) -> io::Result<File> {
    fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(daily_log_path(dir))
}

/// Remove all but the newest `keep` log files. Returns how many were removed.
///
/// File names embed the date, so lexical order is chronological order.
pub fn prune_old_logs(dir: &Path, keep: usize) -> io::Result<usize> {
    let mut logs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX) && n.ends_with(LOG_FILE_SUFFIX))
        })
        .collect();

    logs.sort();
    let excess = logs.len().saturating_sub(keep);

    let mut removed = 0;
    for path in logs.into_iter().take(excess) {
        fs::remove_file(&path)?;
        removed += 1;
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_daily_log_creates_directory() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path().join("nested/logs");

        open_daily_log(&dir)?;

        assert!(daily_log_path(&dir).exists());
        Ok(())
    }

    #[test]
    fn test_first_writable_skips_unusable_dirs() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, b"file")?;
        let usable = temp_dir.path().join("state/logs");

        let picked = first_writable(&[blocker.join("logs"), usable.clone()]);

        assert_eq!(picked, Some(usable.clone()));
        assert!(!usable.join(".write_test").exists());
        Ok(())
    }

    #[test]
    fn test_first_writable_none_when_all_fail() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let blocker = temp_dir.path().join("file");
        fs::write(&blocker, b"file")?;

        assert_eq!(first_writable(&[blocker.join("a"), blocker.join("b")]), None);
        Ok(())
    }

    #[test]
    fn test_explicit_log_dir_wins() {
        let dir = PathBuf::from("/tmp/explicit-logs");
        assert_eq!(resolve_log_dir(Some(dir.clone())), Some(dir));
    }

    #[test]
    fn test_prune_keeps_newest() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        for day in 1..=5 {
            fs::write(temp_dir.path().join(format!("backup-2024010{day}.log")), b"x")?;
        }
        fs::write(temp_dir.path().join("unrelated.txt"), b"keep")?;

        let removed = prune_old_logs(temp_dir.path(), 2)?;

        assert_eq!(removed, 3);
        assert!(temp_dir.path().join("backup-20240104.log").exists());
        assert!(temp_dir.path().join("backup-20240105.log").exists());
        assert!(!temp_dir.path().join("backup-20240103.log").exists());
        assert!(temp_dir.path().join("unrelated.txt").exists());
        Ok(())
    }
}
