//! Retention sweeps over processed events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::store::EventStore;
use crate::telemetry::metrics;

/// Periodically deletes processed events older than the retention period.
pub struct Janitor {
    store: Arc<dyn EventStore>,
    interval: Duration,
    retention: Duration,
}

impl Janitor {
    pub fn new(store: Arc<dyn EventStore>, interval: Duration, retention: Duration) -> Self {
        Self {
            store,
            interval,
            retention,
        }
    }

    /// Delete everything created before `now - retention`. Returns rows removed.
    pub async fn sweep_once(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| Error::Config(format!("retention out of range: {e}")))?;
        let cutoff = Utc::now() - retention;

        let mut session = self.store.acquire().await?;
        let deleted = session.cleanup(cutoff).await?;

        metrics::cleanup_deleted().add(deleted, &[]);
        info!(deleted, cutoff = %cutoff, "processed events cleaned up");
        Ok(deleted)
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, retention = ?self.retention, "janitor started");
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        // The first tick completes immediately; wait a full period instead.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("janitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("cleanup sweep failed: {e}");
                    }
                }
            }
        }
    }
}
