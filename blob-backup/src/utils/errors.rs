//! Error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage request {operation} failed with status {status}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// Errors that must abort a run before any job starts.
    pub fn is_config(&self) -> bool {
        matches!(self, SyncError::Config(_) | SyncError::Pattern(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_classification() {
        assert!(SyncError::Config("bad".into()).is_config());
        assert!(!SyncError::Storage("boom".into()).is_config());
        assert!(!SyncError::Cancelled.is_config());
        assert!(SyncError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_status_message() {
        let err = SyncError::Status {
            operation: "upload",
            status: 403,
            message: "AuthorizationFailure".into(),
        };
        assert_eq!(
            err.to_string(),
            "Storage request upload failed with status 403: AuthorizationFailure"
        );
    }
}
