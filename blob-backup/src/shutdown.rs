//! Turns SIGINT/SIGTERM into cancellation of the run.
//!
//! Units in flight observe the token and stop at their next suspension
//! point; nothing already uploaded is rolled back.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run [`Self::wait_for_signal`] on a background task.
    pub fn spawn(self) -> SignalListener {
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            self.wait_for_signal().await;
        });
        SignalListener { token, handle }
    }

    /// Wait for SIGINT or SIGTERM and cancel the token.
    ///
    /// Returns early without cancelling if the token is cancelled elsewhere.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling run...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling run...");
            }
        }

        self.token.cancel();
    }
}

/// Handle to a spawned signal listener
pub struct SignalListener {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SignalListener {
    /// Cancel the token and wait for the listener task to finish.
    ///
    /// Returns `false` if the task panicked or was aborted.
    pub async fn stop(self) -> bool {
        self.token.cancel();
        match self.handle.await {
            Ok(()) => true,
            Err(e) => {
                debug!("Signal listener ended abnormally: {}", e);
                false
            }
        }
    }
}
