use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::db::{KvStore, StoreError};

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Deletes keys whose TTL has passed.
///
/// Reads already treat expired keys as absent; this only reclaims storage.
pub struct CleanupWorker {
    kv: Arc<dyn KvStore>,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(kv: Arc<dyn KvStore>, config: CleanupWorkerConfig) -> Self {
        Self { kv, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cleanup().await {
                        warn!(error = %e, "Failed to purge expired keys");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One purge pass. Returns the number of keys removed.
    pub async fn run_cleanup(&self) -> Result<u64, StoreError> {
        let deleted = self.kv.purge_expired().await?;
        if deleted > 0 {
            info!(deleted, "Purged expired keys");
        } else {
            debug!("No expired keys");
        }
        Ok(deleted)
    }
}
