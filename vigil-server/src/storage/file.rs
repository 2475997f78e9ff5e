use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use vigil_common::{Metric, MetricKind, VigilError};

use super::{MemoryStorage, MetricStorage};
use crate::error::{StorageError, StorageResult};

/// Snapshot writer state, guarded separately from the metric map
#[derive(Debug)]
struct DumpState {
    file: Option<File>,
    /// Record as of the last successful dump, per id
    persisted: HashMap<String, Metric>,
    #[cfg(test)]
    fail_next_sync: bool,
}

/// Memory store persisted to an append-only NDJSON file.
///
/// Restoring replays every line through the merge rule in file order. To keep
/// that replay exact across repeated dumps, each dump writes counters as the
/// delta accumulated since the previous successful dump and gauges as their
/// current value; records unchanged since the last dump are skipped.
#[derive(Debug)]
pub struct FileStorage {
    memory: MemoryStorage,
    path: PathBuf,
    store_interval: Duration,
    state: Mutex<DumpState>,
}

impl FileStorage {
    /// Open the snapshot at `path`.
    ///
    /// With `restore` the file is replayed into memory before the store is
    /// returned; without it the file is truncated.
    pub async fn open(path: &Path, store_interval: Duration, restore: bool) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let memory = MemoryStorage::new();
        let file = if restore {
            let restored = restore_snapshot(path, &memory).await?;
            info!("Restored {} snapshot records from {}", restored, path.display());
            OpenOptions::new().create(true).append(true).open(path).await?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .await?
        };

        let persisted = memory
            .snapshot()
            .into_iter()
            .map(|metric| (metric.id.clone(), metric))
            .collect();

        Ok(Self {
            memory,
            path: path.to_path_buf(),
            store_interval,
            state: Mutex::new(DumpState {
                file: Some(file),
                persisted,
                #[cfg(test)]
                fail_next_sync: false,
            }),
        })
    }

    /// Append every change since the previous dump. Returns the number of
    /// lines written.
    pub async fn dump(&self) -> StorageResult<usize> {
        // Copy first so writers never wait on file I/O
        let snapshot = self.memory.snapshot();

        let mut state = self.state.lock().await;
        let mut buf = Vec::new();
        let mut written = Vec::new();

        for metric in snapshot {
            let line = match state.persisted.get(&metric.id) {
                Some(previous) if previous == &metric => continue,
                Some(previous) if metric.kind == MetricKind::Counter => {
                    let total = metric.delta.unwrap_or_default();
                    let delta = total
                        .checked_sub(previous.delta.unwrap_or_default())
                        .ok_or_else(|| {
                            VigilError::InvalidMetric(format!(
                                "counter {} delta since last dump overflows",
                                metric.id
                            ))
                        })?;
                    Metric::counter(metric.id.clone(), delta)
                }
                _ => metric.clone(),
            };
            serde_json::to_writer(&mut buf, &line).map_err(VigilError::from)?;
            buf.push(b'\n');
            written.push(metric);
        }

        if written.is_empty() {
            return Ok(0);
        }

        let state = &mut *state;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Unavailable("snapshot file is closed".into()))?;
        let start = file.metadata().await?.len();

        let result = append_synced(file, &buf).await;
        #[cfg(test)]
        let result = match result {
            Ok(()) if std::mem::take(&mut state.fail_next_sync) => {
                Err(std::io::Error::other("injected sync failure"))
            }
            other => other,
        };

        if let Err(e) = result {
            // A partial or unsynced append must not survive: the next dump
            // rewrites the same deltas
            if let Err(truncate) = rollback(file, start).await {
                error!(
                    "Failed to roll back {} to {} bytes: {}; closing snapshot file",
                    self.path.display(),
                    start,
                    truncate
                );
                state.file = None;
            }
            return Err(e.into());
        }

        let count = written.len();
        for metric in written {
            state.persisted.insert(metric.id.clone(), metric);
        }
        debug!("Dumped {} records to {}", count, self.path.display());
        Ok(count)
    }
}

async fn append_synced(file: &mut File, buf: &[u8]) -> std::io::Result<()> {
    file.write_all(buf).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Cut the file back to `len` bytes and continue writing from there
async fn rollback(file: &mut File, len: u64) -> std::io::Result<()> {
    file.set_len(len).await?;
    file.seek(SeekFrom::Start(len)).await?;
    file.sync_data().await
}

/// Replay the NDJSON snapshot into `memory`. A missing file restores nothing.
async fn restore_snapshot(path: &Path, memory: &MemoryStorage) -> StorageResult<usize> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut restored = 0;
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let metric: Metric = serde_json::from_str(line).map_err(|source| StorageError::Snapshot {
            line: index + 1,
            source,
        })?;
        metric.validate()?;
        memory.merge(&metric)?;
        restored += 1;
    }
    Ok(restored)
}

#[async_trait]
impl MetricStorage for FileStorage {
    async fn update_metrics(&self, batch: &[Metric]) -> StorageResult<Vec<Metric>> {
        self.memory.update_metrics(batch).await
    }

    async fn get_metric(&self, id: &str, kind: MetricKind) -> StorageResult<Metric> {
        self.memory.get_metric(id, kind).await
    }

    async fn get_all_metrics(&self) -> StorageResult<Vec<Metric>> {
        self.memory.get_all_metrics().await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.memory.ping().await
    }

    async fn close(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
            file.sync_all().await?;
            info!("Closed snapshot file {}", self.path.display());
        }
        Ok(())
    }

    async fn dump_metrics_by_interval(&self, shutdown: &CancellationToken) -> StorageResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.store_interval) => {}
            _ = shutdown.cancelled() => {}
        }
        self.dump().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const INTERVAL: Duration = Duration::from_secs(300);

    async fn read_lines(path: &Path) -> Vec<Metric> {
        fs::read_to_string(path)
            .await
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.dump");

        let storage = FileStorage::open(&path, INTERVAL, false).await.unwrap();
        storage
            .update_metrics(&[Metric::gauge("A", 1.0), Metric::counter("B", 4)])
            .await
            .unwrap();
        storage.dump().await.unwrap();
        storage.close().await.unwrap();

        let restored = FileStorage::open(&path, INTERVAL, true).await.unwrap();
        let a = restored.get_metric("A", MetricKind::Gauge).await.unwrap();
        let b = restored.get_metric("B", MetricKind::Counter).await.unwrap();
        assert_eq!(a.value, Some(1.0));
        assert_eq!(b.delta, Some(4));
    }

    #[tokio::test]
    async fn test_repeated_dumps_write_counter_deltas() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.dump");

        let storage = FileStorage::open(&path, INTERVAL, false).await.unwrap();
        storage.update_metrics(&[Metric::counter("C", 4)]).await.unwrap();
        assert_eq!(storage.dump().await.unwrap(), 1);
        // Unchanged since last dump
        assert_eq!(storage.dump().await.unwrap(), 0);

        storage.update_metrics(&[Metric::counter("C", 6)]).await.unwrap();
        assert_eq!(storage.dump().await.unwrap(), 1);
        storage.close().await.unwrap();

        let lines = read_lines(&path).await;
        assert_eq!(lines, vec![Metric::counter("C", 4), Metric::counter("C", 6)]);

        let restored = FileStorage::open(&path, INTERVAL, true).await.unwrap();
        let c = restored.get_metric("C", MetricKind::Counter).await.unwrap();
        assert_eq!(c.delta, Some(10));
    }

    #[tokio::test]
    async fn test_restore_then_append_keeps_history_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.dump");

        let first = FileStorage::open(&path, INTERVAL, false).await.unwrap();
        first
            .update_metrics(&[Metric::counter("C", 3), Metric::gauge("G", 1.0)])
            .await
            .unwrap();
        first.dump().await.unwrap();
        first.close().await.unwrap();

        let second = FileStorage::open(&path, INTERVAL, true).await.unwrap();
        // Restored records are already on disk
        assert_eq!(second.dump().await.unwrap(), 0);
        second
            .update_metrics(&[Metric::counter("C", 2), Metric::gauge("G", 7.5)])
            .await
            .unwrap();
        second.dump().await.unwrap();
        second.close().await.unwrap();

        let third = FileStorage::open(&path, INTERVAL, true).await.unwrap();
        assert_eq!(
            third.get_metric("C", MetricKind::Counter).await.unwrap().delta,
            Some(5)
        );
        assert_eq!(
            third.get_metric("G", MetricKind::Gauge).await.unwrap().value,
            Some(7.5)
        );
    }

    #[tokio::test]
    async fn test_open_without_restore_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.dump");
        fs::write(&path, "{\"id\":\"old\",\"type\":\"counter\",\"delta\":1}\n")
            .await
            .unwrap();

        let storage = FileStorage::open(&path, INTERVAL, false).await.unwrap();
        assert!(storage.get_all_metrics().await.unwrap().is_empty());
        assert!(fs::read_to_string(&path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("metrics.dump");

        let storage = FileStorage::open(&path, INTERVAL, true).await.unwrap();
        assert!(storage.get_all_metrics().await.unwrap().is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_reports_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.dump");
        fs::write(&path, "{\"id\":\"G\",\"type\":\"gauge\",\"value\":1.0}\nnot json\n")
            .await
            .unwrap();

        let err = FileStorage::open(&path, INTERVAL, true).await.unwrap_err();
        assert!(matches!(err, StorageError::Snapshot { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_dump_by_interval_flushes_on_cancel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.dump");
        let storage = FileStorage::open(&path, INTERVAL, false).await.unwrap();
        storage.update_metrics(&[Metric::gauge("G", 2.0)]).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        storage.dump_metrics_by_interval(&token).await.unwrap();

        assert_eq!(read_lines(&path).await, vec![Metric::gauge("G", 2.0)]);
    }

    #[tokio::test]
    async fn test_failed_dump_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.dump");
        let storage = FileStorage::open(&path, INTERVAL, false).await.unwrap();
        storage.update_metrics(&[Metric::counter("C", 4)]).await.unwrap();
        storage.dump().await.unwrap();
        let len_after_first = fs::metadata(&path).await.unwrap().len();

        storage.update_metrics(&[Metric::counter("C", 6)]).await.unwrap();
        storage.state.lock().await.fail_next_sync = true;
        assert!(matches!(storage.dump().await, Err(StorageError::Io(_))));
        // The landed bytes were cut off again
        assert_eq!(fs::metadata(&path).await.unwrap().len(), len_after_first);

        // The retry writes the same delta exactly once
        assert_eq!(storage.dump().await.unwrap(), 1);
        storage.close().await.unwrap();
        assert_eq!(
            read_lines(&path).await,
            vec![Metric::counter("C", 4), Metric::counter("C", 6)]
        );

        let restored = FileStorage::open(&path, INTERVAL, true).await.unwrap();
        assert_eq!(
            restored.get_metric("C", MetricKind::Counter).await.unwrap().delta,
            Some(10)
        );
    }

    #[tokio::test]
    async fn test_failed_dump_after_restore_appends_cleanly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.dump");
        fs::write(&path, "{\"id\":\"C\",\"type\":\"counter\",\"delta\":1}\n")
            .await
            .unwrap();

        let storage = FileStorage::open(&path, INTERVAL, true).await.unwrap();
        storage.update_metrics(&[Metric::counter("C", 2)]).await.unwrap();
        storage.state.lock().await.fail_next_sync = true;
        assert!(storage.dump().await.is_err());
        storage.dump().await.unwrap();
        storage.close().await.unwrap();

        let restored = FileStorage::open(&path, INTERVAL, true).await.unwrap();
        assert_eq!(
            restored.get_metric("C", MetricKind::Counter).await.unwrap().delta,
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_dump_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.dump");
        let storage = FileStorage::open(&path, INTERVAL, false).await.unwrap();
        storage.close().await.unwrap();
        storage.update_metrics(&[Metric::gauge("G", 2.0)]).await.unwrap();

        assert!(matches!(storage.dump().await, Err(StorageError::Unavailable(_))));
    }
}
