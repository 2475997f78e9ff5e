//! Metric storage engines
//!
//! Every backend implements [`MetricStorage`]. [`RetryStorage`] is a decorator
//! over any of them; [`open_storage`] picks the backend from configuration and
//! always hands back the decorated store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vigil_common::{Metric, MetricKind, RetryConfig};

use crate::config::StorageConfig;
use crate::error::StorageResult;

pub mod memory;
pub mod file;
pub mod database;
pub mod retry;

pub use database::DatabaseStorage;
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use retry::RetryStorage;

#[async_trait]
pub trait MetricStorage: Send + Sync {
    /// Merge every record of `batch` and return the post-merge records in
    /// input order.
    ///
    /// A malformed or kind-conflicting batch is rejected before anything is
    /// applied. Postgres makes the whole batch one transaction. The memory
    /// and file stores check up front and then merge record by record, so a
    /// concurrent writer creating a conflicting id in between, or a counter
    /// overflow, can still leave earlier records of the batch applied.
    async fn update_metrics(&self, batch: &[Metric]) -> StorageResult<Vec<Metric>>;

    /// Fetch one record; `NotFound` when this id/kind pair was never written.
    async fn get_metric(&self, id: &str, kind: MetricKind) -> StorageResult<Metric>;

    /// Full snapshot, unordered
    async fn get_all_metrics(&self) -> StorageResult<Vec<Metric>>;

    async fn ping(&self) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;

    /// Wait for one store interval or for `shutdown`, whichever is first,
    /// then flush once.
    async fn dump_metrics_by_interval(&self, shutdown: &CancellationToken) -> StorageResult<()>;
}

/// Build the configured backend wrapped in the retry decorator.
///
/// A database DSN selects Postgres; otherwise the file-snapshot backend is
/// used. Failing to open the backend is fatal for the caller.
pub async fn open_storage(config: &StorageConfig) -> StorageResult<Arc<dyn MetricStorage>> {
    let retry = RetryConfig::new(config.retry_attempts);

    match config.database_dsn.as_deref().filter(|dsn| !dsn.is_empty()) {
        Some(dsn) => {
            info!("Using Postgres storage");
            let db = DatabaseStorage::connect(dsn, config.store_interval).await?;
            Ok(Arc::new(RetryStorage::new(db, retry)))
        }
        None => {
            info!("Using file storage at {}", config.file_storage_path.display());
            let file = FileStorage::open(
                &config.file_storage_path,
                config.store_interval,
                config.restore,
            )
            .await?;
            Ok(Arc::new(RetryStorage::new(file, retry)))
        }
    }
}
