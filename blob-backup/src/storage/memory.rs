//! In-process object store.
//!
//! Behaves like a tiered blob store closely enough to exercise the engine:
//! archived objects refuse overwrites until rehydrated, and rehydration
//! completes after a configurable number of status polls.

use super::{cancellable, ObjectBody, ObjectStore, StorageUploadOptions, StoredObjectInfo};
use crate::config::StorageTier;
use crate::utils::{Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Archive status reported while a rehydration is pending
pub const REHYDRATE_PENDING: &str = "rehydrate-pending-to-hot";

#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub data: Bytes,
    pub fingerprint: Option<String>,
    pub tier: StorageTier,
    pub content_type: Option<String>,
    pub archive_status: Option<String>,
    polls_until_ready: usize,
}

impl MemoryObject {
    pub fn new(data: impl Into<Bytes>, fingerprint: Option<String>, tier: StorageTier) -> Self {
        Self {
            data: data.into(),
            fingerprint,
            tier,
            content_type: None,
            archive_status: None,
            polls_until_ready: 0,
        }
    }

    fn info(&self, key: &str) -> StoredObjectInfo {
        StoredObjectInfo {
            key: key.to_string(),
            fingerprint: self.fingerprint.clone(),
            tier: Some(self.tier.to_string()),
            archive_status: self.archive_status.clone(),
        }
    }
}

/// Counters describing how the store was used
#[derive(Debug, Default)]
struct UsageStats {
    info_requests: AtomicUsize,
    uploads: AtomicUsize,
    rehydrations: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

pub struct MemoryStore {
    name: String,
    objects: DashMap<String, MemoryObject>,
    failing_keys: Mutex<HashSet<String>>,
    ready: AtomicBool,
    latency: Duration,
    polls_to_thaw: usize,
    stats: UsageStats,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: DashMap::new(),
            failing_keys: Mutex::new(HashSet::new()),
            ready: AtomicBool::new(false),
            latency: Duration::ZERO,
            polls_to_thaw: 1,
            stats: UsageStats::default(),
        }
    }

    /// Delay applied to every metadata lookup
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Status polls a rehydration needs before it completes
    pub fn with_polls_to_thaw(mut self, polls: usize) -> Self {
        self.polls_to_thaw = polls;
        self
    }

    pub fn insert(&self, key: impl Into<String>, object: MemoryObject) {
        self.objects.insert(key.into(), object);
    }

    pub fn get(&self, key: &str) -> Option<MemoryObject> {
        self.objects.get(key).map(|o| o.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Make every upload to `key` fail
    pub fn fail_uploads_to(&self, key: impl Into<String>) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.insert(key.into());
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn info_requests(&self) -> usize {
        self.stats.info_requests.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.stats.uploads.load(Ordering::SeqCst)
    }

    pub fn rehydration_count(&self) -> usize {
        self.stats.rehydrations.load(Ordering::SeqCst)
    }

    /// Highest number of metadata lookups observed at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.stats.peak_in_flight.load(Ordering::SeqCst)
    }

    fn is_failing(&self, key: &str) -> bool {
        self.failing_keys
            .lock()
            .map(|keys| keys.contains(key))
            .unwrap_or(false)
    }

    async fn lookup(&self, key: &str) -> Option<StoredObjectInfo> {
        let current = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let info = self.objects.get_mut(key).map(|mut object| {
            if object.archive_status.is_some() {
                object.polls_until_ready = object.polls_until_ready.saturating_sub(1);
                if object.polls_until_ready == 0 {
                    object.archive_status = None;
                    object.tier = StorageTier::Hot;
                }
            }
            object.info(key)
        });

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        info
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn try_get_info(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredObjectInfo>> {
        self.stats.info_requests.fetch_add(1, Ordering::SeqCst);
        cancellable(cancel, async { Ok(self.lookup(key).await) }).await
    }

    async fn upload(
        &self,
        key: &str,
        body: ObjectBody,
        options: &StorageUploadOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.is_failing(key) {
            return Err(SyncError::Storage(format!("injected upload failure for {key}")));
        }

        if let Some(existing) = self.objects.get(key) {
            if !options.overwrite {
                return Err(SyncError::Storage(format!("{key} already exists")));
            }
            if existing.tier == StorageTier::Archive {
                return Err(SyncError::Storage(format!(
                    "{key} is archived and must be rehydrated before overwrite"
                )));
            }
        }

        let mut data = Vec::with_capacity(body.len() as usize);
        let mut reader = body.into_reader();
        cancellable(cancel, async {
            reader.read_to_end(&mut data).await?;
            Ok(())
        })
        .await?;

        let mut object = MemoryObject::new(data, options.fingerprint.clone(), options.tier);
        object.content_type = options.content_type.clone();
        self.objects.insert(key.to_string(), object);
        self.stats.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rehydrate(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let mut object = self
            .objects
            .get_mut(key)
            .ok_or_else(|| SyncError::Storage(format!("{key} not found")))?;

        object.archive_status = Some(REHYDRATE_PENDING.to_string());
        object.polls_until_ready = self.polls_to_thaw.max(1);
        self.stats.rehydrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(tier: StorageTier) -> StorageUploadOptions {
        StorageUploadOptions {
            tier,
            fingerprint: Some("abc".into()),
            overwrite: true,
            content_type: Some("text/plain".into()),
        }
    }

    #[tokio::test]
    async fn test_upload_then_info() -> Result<()> {
        let store = MemoryStore::new("test");
        let cancel = CancellationToken::new();

        assert!(store.try_get_info("a.txt", &cancel).await?.is_none());

        store
            .upload("a.txt", ObjectBody::from_bytes(b"data".to_vec()), &options(StorageTier::Cool), &cancel)
            .await?;

        let info = store.try_get_info("a.txt", &cancel).await?.unwrap();
        assert_eq!(info.fingerprint.as_deref(), Some("abc"));
        assert_eq!(info.tier.as_deref(), Some("Cool"));
        assert_eq!(store.get("a.txt").unwrap().data, Bytes::from_static(b"data"));
        assert_eq!(store.upload_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_archived_object_thaws_after_polls() -> Result<()> {
        let store = MemoryStore::new("test").with_polls_to_thaw(2);
        let cancel = CancellationToken::new();
        store.insert("old.bin", MemoryObject::new(&b"old"[..], None, StorageTier::Archive));

        let overwrite = store
            .upload("old.bin", ObjectBody::from_bytes(b"new".to_vec()), &options(StorageTier::Cool), &cancel)
            .await;
        assert!(overwrite.is_err());

        store.rehydrate("old.bin", &cancel).await?;
        assert!(store.try_get_info("old.bin", &cancel).await?.unwrap().is_rehydrating());
        let thawed = store.try_get_info("old.bin", &cancel).await?.unwrap();
        assert!(!thawed.is_rehydrating());
        assert!(!thawed.is_archived());

        store
            .upload("old.bin", ObjectBody::from_bytes(b"new".to_vec()), &options(StorageTier::Cool), &cancel)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_no_overwrite_rejects_existing() -> Result<()> {
        let store = MemoryStore::new("test");
        let cancel = CancellationToken::new();
        store.insert("a", MemoryObject::new(&b"x"[..], None, StorageTier::Hot));

        let mut opts = options(StorageTier::Hot);
        opts.overwrite = false;
        let result = store.upload("a", ObjectBody::from_bytes(vec![1]), &opts, &cancel).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new("test");
        let cancel = CancellationToken::new();
        store.fail_uploads_to("bad");

        let result = store
            .upload("bad", ObjectBody::from_bytes(vec![1]), &options(StorageTier::Hot), &cancel)
            .await;
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(store.upload_count(), 0);
    }
}
