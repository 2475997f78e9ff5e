use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vigil_common::{retry_with_backoff, Metric, MetricKind, RetryConfig};

use super::MetricStorage;
use crate::error::{StorageError, StorageResult};

/// Decides whether a failed storage call is worth another attempt
pub type RetryClassifier = fn(&StorageError) -> bool;

/// Wraps any backend and retries its operations with linear backoff.
///
/// Only errors accepted by the classifier are retried; everything else, and
/// the last error once attempts run out, reaches the caller unchanged.
pub struct RetryStorage<S> {
    inner: S,
    config: RetryConfig,
    classify: RetryClassifier,
}

impl<S: MetricStorage> RetryStorage<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self::with_classifier(inner, config, StorageError::is_transient)
    }

    pub fn with_classifier(inner: S, config: RetryConfig, classify: RetryClassifier) -> Self {
        Self {
            inner,
            config,
            classify,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: MetricStorage> MetricStorage for RetryStorage<S> {
    async fn update_metrics(&self, batch: &[Metric]) -> StorageResult<Vec<Metric>> {
        retry_with_backoff(&self.config, None, self.classify, || {
            self.inner.update_metrics(batch)
        })
        .await
    }

    async fn get_metric(&self, id: &str, kind: MetricKind) -> StorageResult<Metric> {
        retry_with_backoff(&self.config, None, self.classify, || {
            self.inner.get_metric(id, kind)
        })
        .await
    }

    async fn get_all_metrics(&self) -> StorageResult<Vec<Metric>> {
        retry_with_backoff(&self.config, None, self.classify, || {
            self.inner.get_all_metrics()
        })
        .await
    }

    async fn ping(&self) -> StorageResult<()> {
        retry_with_backoff(&self.config, None, self.classify, || self.inner.ping()).await
    }

    async fn close(&self) -> StorageResult<()> {
        retry_with_backoff(&self.config, None, self.classify, || self.inner.close()).await
    }

    async fn dump_metrics_by_interval(&self, shutdown: &CancellationToken) -> StorageResult<()> {
        retry_with_backoff(&self.config, None, self.classify, || {
            self.inner.dump_metrics_by_interval(shutdown)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    /// Fails `failures` times with `error`, then delegates to memory
    struct FlakyStorage {
        calls: AtomicU32,
        failures: u32,
        error: fn() -> StorageError,
        memory: MemoryStorage,
    }

    impl FlakyStorage {
        fn new(failures: u32, error: fn() -> StorageError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                error,
                memory: MemoryStorage::new(),
            }
        }

        fn fail(&self) -> StorageResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err((self.error)())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MetricStorage for FlakyStorage {
        async fn update_metrics(&self, batch: &[Metric]) -> StorageResult<Vec<Metric>> {
            self.fail()?;
            self.memory.update_metrics(batch).await
        }

        async fn get_metric(&self, id: &str, kind: MetricKind) -> StorageResult<Metric> {
            self.fail()?;
            self.memory.get_metric(id, kind).await
        }

        async fn get_all_metrics(&self) -> StorageResult<Vec<Metric>> {
            self.fail()?;
            self.memory.get_all_metrics().await
        }

        async fn ping(&self) -> StorageResult<()> {
            self.fail()
        }

        async fn close(&self) -> StorageResult<()> {
            Ok(())
        }

        async fn dump_metrics_by_interval(&self, _shutdown: &CancellationToken) -> StorageResult<()> {
            self.fail()
        }
    }

    fn connection_error() -> StorageError {
        StorageError::Connection("connection refused".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_with_backoff() {
        let storage = RetryStorage::new(FlakyStorage::new(2, connection_error), RetryConfig::new(4));
        let start = Instant::now();

        let merged = storage.update_metrics(&[Metric::counter("C", 4)]).await.unwrap();

        assert_eq!(merged[0].delta, Some(4));
        assert_eq!(storage.inner().calls.load(Ordering::SeqCst), 3);
        // 1s + 3s
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let storage = RetryStorage::new(FlakyStorage::new(0, connection_error), RetryConfig::new(4));
        let start = Instant::now();

        let err = storage.get_metric("missing", MetricKind::Gauge).await.unwrap_err();

        assert!(matches!(err, StorageError::NotFound { .. }));
        assert_eq!(storage.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let storage = RetryStorage::new(FlakyStorage::new(10, connection_error), RetryConfig::new(3));

        let err = storage.ping().await.unwrap_err();

        assert!(matches!(err, StorageError::Connection(_)));
        assert_eq!(storage.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let storage = RetryStorage::with_classifier(
            FlakyStorage::new(1, || StorageError::Unavailable("warming up".into())),
            RetryConfig::new(3),
            |e| matches!(e, StorageError::Unavailable(_)),
        );

        storage.get_all_metrics().await.unwrap();
        assert_eq!(storage.inner().calls.load(Ordering::SeqCst), 2);
    }
}
