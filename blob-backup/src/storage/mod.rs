//! Remote object storage abstraction.
//!
//! The engine only talks to [`ObjectStore`]. Backends own transport, auth and
//! tier mechanics; the engine owns the decision of when to use them.

pub mod azure;
pub mod key;
pub mod memory;

use crate::config::{DestinationSpec, StorageTier};
use crate::utils::{Result, SyncError};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// What the store knows about an existing object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObjectInfo {
    pub key: String,

    /// Fingerprint recorded at the last upload, if any
    pub fingerprint: Option<String>,

    /// Current tier as reported by the store
    pub tier: Option<String>,

    /// Set while a rehydration from the archive tier is in progress
    pub archive_status: Option<String>,
}

impl StoredObjectInfo {
    pub fn is_archived(&self) -> bool {
        self.tier
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(StorageTier::Archive.as_str()))
    }

    pub fn is_rehydrating(&self) -> bool {
        self.archive_status.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Options for a single upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUploadOptions {
    pub tier: StorageTier,
    pub fingerprint: Option<String>,
    pub overwrite: bool,
    pub content_type: Option<String>,
}

/// Upload payload with a known length
pub struct ObjectBody {
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    len: u64,
}

impl ObjectBody {
    pub fn new(reader: impl AsyncRead + Send + Sync + Unpin + 'static, len: u64) -> Self {
        Self {
            reader: Box::new(reader),
            len,
        }
    }

    pub async fn from_file(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self::new(file, len))
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self::new(std::io::Cursor::new(data), len)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_reader(self) -> Box<dyn AsyncRead + Send + Sync + Unpin> {
        self.reader
    }
}

/// Capabilities the sync engine needs from a remote store.
///
/// `try_get_info` returns `Ok(None)` for a missing object; errors are
/// reserved for real failures. Every call receives the run's cancellation
/// token and should return [`SyncError::Cancelled`] promptly once it fires.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short human-readable location, for logs
    fn describe(&self) -> String;

    /// Prepare the destination (e.g. create the container)
    async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<()>;

    async fn try_get_info(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredObjectInfo>>;

    async fn upload(
        &self,
        key: &str,
        body: ObjectBody,
        options: &StorageUploadOptions,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Ask the store to move an archived object back to an online tier
    async fn rehydrate(&self, key: &str, cancel: &CancellationToken) -> Result<()>;
}

/// Builds a store for a job's destination.
pub trait StoreFactory: Send + Sync {
    fn create(&self, destination: &DestinationSpec) -> Result<Arc<dyn ObjectStore>>;
}

/// Race `fut` against `cancel`.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = fut => result,
    }
}
