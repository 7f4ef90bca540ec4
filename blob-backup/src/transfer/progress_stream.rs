//! Upload body stream that reports how far an upload has got.
//!
//! Reports are throttled to one per interval, so short uploads produce none
//! and only long-running transfers show up in the job log.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Default spacing between reports for a single upload
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Snapshot of one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.sent as f64 / self.total as f64 * 100.0).min(100.0)
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

pub struct ProgressStream<S> {
    inner: S,
    progress: UploadProgress,
    last_report: Instant,
    interval: Duration,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    /// `total` is the expected body length, used for percentages.
    pub fn new(inner: S, total: u64, callback: ProgressCallback) -> Self {
        Self {
            inner,
            progress: UploadProgress { sent: 0, total },
            last_report: Instant::now(),
            interval: DEFAULT_REPORT_INTERVAL,
            callback,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn progress(&self) -> UploadProgress {
        self.progress
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);

        if let Poll::Ready(Some(Ok(bytes))) = &polled {
            self.progress.sent += bytes.len() as u64;

            let now = Instant::now();
            if now.duration_since(self.last_report) >= self.interval {
                self.last_report = now;
                (self.callback)(self.progress);
            }
        }

        polled
    }
}
