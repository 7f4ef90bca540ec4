//! Blob Backup Library
//!
//! Incremental, tier-aware backup of local file trees to blob storage.

pub mod config;
pub mod executor;
pub mod fs;
pub mod runner;
pub mod shutdown;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::{BackupConfig, ConfigLoader, FileConfigLoader};
pub use runner::{RunOptions, RunStatus, Runner};
pub use utils::errors::SyncError;
pub type Result<T> = std::result::Result<T, SyncError>;
