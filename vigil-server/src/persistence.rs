//! Periodic persistence of the metric store

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::storage::MetricStorage;

/// Drives `dump_metrics_by_interval` until shutdown, then closes the store.
pub struct PersistenceScheduler {
    storage: Arc<dyn MetricStorage>,
}

impl PersistenceScheduler {
    pub fn new(storage: Arc<dyn MetricStorage>) -> Self {
        Self { storage }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The call made after cancellation is the final flush. Dump errors are
    /// logged and the loop continues.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting persistence scheduler");

        loop {
            match self.storage.dump_metrics_by_interval(&shutdown).await {
                Ok(()) => debug!("Metrics persisted"),
                Err(e) => error!("Failed to persist metrics: {}", e),
            }
            if shutdown.is_cancelled() {
                break;
            }
        }

        if let Err(e) = self.storage.close().await {
            error!("Failed to close storage: {}", e);
        }
        info!("Persistence scheduler stopped");
    }
}
