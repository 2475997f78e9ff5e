//! Postgres storage backend
//!
//! One row per metric id. A batch is applied inside a single transaction, so
//! any failing record (a kind mismatch included) rolls back the whole batch.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vigil_common::{Metric, MetricKind, VigilError};

use super::MetricStorage;
use crate::error::{StorageError, StorageResult};

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const UPSERT_METRIC: &str = r#"
    INSERT INTO metrics (id, kind, delta, value)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (id) DO UPDATE
        SET delta = metrics.delta + EXCLUDED.delta,
            value = EXCLUDED.value
        WHERE metrics.kind = EXCLUDED.kind
    RETURNING id, kind, delta, value
"#;

pub struct DatabaseStorage {
    pool: PgPool,
    store_interval: Duration,
}

impl DatabaseStorage {
    /// Connect to `dsn` and make sure the schema exists
    pub async fn connect(dsn: &str, store_interval: Duration) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(dsn)
            .await?;

        let storage = Self::from_pool(pool, store_interval);
        storage.run_migrations().await?;
        info!("Connected to Postgres metric store");
        Ok(storage)
    }

    pub fn from_pool(pool: PgPool, store_interval: Duration) -> Self {
        Self {
            pool,
            store_interval,
        }
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                delta BIGINT,
                value DOUBLE PRECISION
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert(tx: &mut Transaction<'_, Postgres>, metric: &Metric) -> StorageResult<Metric> {
        let row = sqlx::query(UPSERT_METRIC)
            .bind(&metric.id)
            .bind(metric.kind.as_str())
            .bind(metric.delta)
            .bind(metric.value)
            .fetch_optional(&mut **tx)
            .await?;

        match row {
            Some(row) => row_to_metric(&row),
            // The conflict guard filtered the update out: stored kind differs
            None => {
                let stored: String = sqlx::query_scalar("SELECT kind FROM metrics WHERE id = $1")
                    .bind(&metric.id)
                    .fetch_one(&mut **tx)
                    .await?;
                Err(VigilError::KindMismatch {
                    id: metric.id.clone(),
                    stored: stored.parse()?,
                    incoming: metric.kind,
                }
                .into())
            }
        }
    }
}

fn row_to_metric(row: &PgRow) -> StorageResult<Metric> {
    let kind: String = row.try_get("kind")?;
    Ok(Metric {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        delta: row.try_get("delta")?,
        value: row.try_get("value")?,
    })
}

#[async_trait]
impl MetricStorage for DatabaseStorage {
    async fn update_metrics(&self, batch: &[Metric]) -> StorageResult<Vec<Metric>> {
        for metric in batch {
            metric.validate()?;
        }

        let mut tx = self.pool.begin().await?;
        let mut merged = Vec::with_capacity(batch.len());
        for metric in batch {
            // Dropping `tx` on error rolls the batch back
            merged.push(Self::upsert(&mut tx, metric).await?);
        }
        tx.commit().await.map_err(StorageError::from_commit)?;

        debug!("Upserted {} metrics", merged.len());
        Ok(merged)
    }

    async fn get_metric(&self, id: &str, kind: MetricKind) -> StorageResult<Metric> {
        let row = sqlx::query("SELECT id, kind, delta, value FROM metrics WHERE id = $1 AND kind = $2")
            .bind(id)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_metric(&row),
            None => Err(StorageError::not_found(id, kind)),
        }
    }

    async fn get_all_metrics(&self) -> StorageResult<Vec<Metric>> {
        let rows = sqlx::query("SELECT id, kind, delta, value FROM metrics")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_metric).collect()
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        info!("Closed Postgres pool");
        Ok(())
    }

    async fn dump_metrics_by_interval(&self, shutdown: &CancellationToken) -> StorageResult<()> {
        // Every write is already durable
        tokio::select! {
            _ = tokio::time::sleep(self.store_interval) => {}
            _ = shutdown.cancelled() => {}
        }
        Ok(())
    }
}
