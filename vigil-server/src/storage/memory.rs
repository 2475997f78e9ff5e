use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use vigil_common::{Metric, MetricKind, VigilError};

use super::MetricStorage;
use crate::error::{StorageError, StorageResult};

/// In-memory store keyed by metric id.
///
/// Merges go through the map's entry API, so only the shard holding the key
/// is locked while one record is applied; unrelated ids proceed in parallel.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    metrics: DashMap<String, Metric>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one record and return the stored result
    pub fn merge(&self, metric: &Metric) -> StorageResult<Metric> {
        match self.metrics.entry(metric.id.clone()) {
            Entry::Occupied(mut entry) => {
                let stored = entry.get_mut();
                stored.merge(metric)?;
                Ok(stored.clone())
            }
            Entry::Vacant(entry) => Ok(entry.insert(metric.clone()).value().clone()),
        }
    }

    /// Copy of every record; each shard is locked only while it is copied
    pub fn snapshot(&self) -> Vec<Metric> {
        self.metrics.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Fail on the first record whose kind conflicts with the stored record
    /// or with an earlier record of the same id in `batch`
    fn check_kinds(&self, batch: &[Metric]) -> StorageResult<()> {
        let mut expected: HashMap<&str, MetricKind> = HashMap::new();
        for metric in batch {
            let kind = *expected.entry(metric.id.as_str()).or_insert_with(|| {
                self.metrics
                    .get(&metric.id)
                    .map_or(metric.kind, |stored| stored.kind)
            });
            if kind != metric.kind {
                return Err(VigilError::KindMismatch {
                    id: metric.id.clone(),
                    stored: kind,
                    incoming: metric.kind,
                }
                .into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MetricStorage for MemoryStorage {
    async fn update_metrics(&self, batch: &[Metric]) -> StorageResult<Vec<Metric>> {
        // Reject malformed or conflicting batches before touching any slot
        for metric in batch {
            metric.validate()?;
        }
        self.check_kinds(batch)?;
        batch.iter().map(|metric| self.merge(metric)).collect()
    }

    async fn get_metric(&self, id: &str, kind: MetricKind) -> StorageResult<Metric> {
        self.metrics
            .get(id)
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::not_found(id, kind))
    }

    async fn get_all_metrics(&self) -> StorageResult<Vec<Metric>> {
        Ok(self.snapshot())
    }

    async fn ping(&self) -> StorageResult<()> {
        Err(StorageError::Unavailable("no backing database".into()))
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn dump_metrics_by_interval(&self, shutdown: &CancellationToken) -> StorageResult<()> {
        // Nothing to persist; just pace the caller's loop
        shutdown.cancelled().await;
        Ok(())
    }
}
