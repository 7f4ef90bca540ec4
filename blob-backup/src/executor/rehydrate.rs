//! Archive-tier rehydration gate.
//!
//! An archived object cannot be overwritten until the store has moved it back
//! to an online tier. The gate walks a small state machine:
//!
//! ```text
//! Cold --rehydrate()--> Thawing --poll: no archive status--> Ready
//!                          ^  |
//!                          +--+ poll: still rehydrating
//! ```
//!
//! The caller keeps its concurrency permit for the entire wait. With many
//! archived targets and a small concurrency limit, a job therefore runs at
//! the pace of rehydration (hours on most stores). Releasing the permit while
//! thawing would lift that, at the cost of more in-flight rehydrations. There
//! is no timeout; cancellation is the only way out of a stuck wait.

use crate::storage::{cancellable, ObjectStore, StoredObjectInfo};
use crate::utils::{Result, SyncError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Interval between status polls while an object thaws
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehydrationState {
    /// Archived and not yet asked to move
    Cold,
    /// Rehydration requested and still in progress
    Thawing,
    /// Safe to overwrite
    Ready,
}

impl RehydrationState {
    /// Classify what the store reported about the target.
    pub fn of(info: Option<&StoredObjectInfo>) -> Self {
        match info {
            Some(info) if info.is_rehydrating() => RehydrationState::Thawing,
            Some(info) if info.is_archived() => RehydrationState::Cold,
            _ => RehydrationState::Ready,
        }
    }

    /// Thawing only ends once the in-progress marker disappears.
    fn after_poll(info: Option<&StoredObjectInfo>) -> Self {
        match info {
            Some(info) if info.is_rehydrating() => RehydrationState::Thawing,
            _ => RehydrationState::Ready,
        }
    }
}

/// What the gate had to do before the target became writable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RehydrationReport {
    pub requested: bool,
    pub polls: usize,
}

/// Block until `key` can be overwritten.
///
/// `current` is the info already fetched for the key; a target that is not
/// archived returns immediately without touching the store.
pub async fn wait_until_writable(
    store: &dyn ObjectStore,
    key: &str,
    current: Option<&StoredObjectInfo>,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<RehydrationReport> {
    let mut report = RehydrationReport::default();
    let mut state = RehydrationState::of(current);

    loop {
        match state {
            RehydrationState::Ready => return Ok(report),
            RehydrationState::Cold => {
                info!(key = %key, "Target is archived, requesting rehydration");
                store.rehydrate(key, cancel).await?;
                report.requested = true;
                state = RehydrationState::Thawing;
            }
            RehydrationState::Thawing => {
                cancellable(cancel, async {
                    tokio::time::sleep(poll_interval).await;
                    Ok::<_, SyncError>(())
                })
                .await?;

                report.polls += 1;
                let info = store.try_get_info(key, cancel).await?;
                state = RehydrationState::after_poll(info.as_ref());
                debug!(key = %key, polls = report.polls, ?state, "Rehydration poll");
            }
        }
    }
}
