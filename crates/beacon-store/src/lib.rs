// beacon-store - columnar time-series storage
//
// Parquet files over an OpenDAL operator (filesystem, S3, or in-memory),
// partitioned by rollup resolution and month:
//
//   metrics/res={resolution}/month={YYYY-MM}/{min_ts}-{hash16}.parquet
//
// Writes are batched, sorted by (service_name, metric_name, timestamp) and
// named by content hash, so re-inserting an identical batch lands on the
// same object. Reads prune by month, deduplicate by row id, and fall back
// from raw to hourly to daily partitions month by month once retention has
// removed the finer data.

use std::time::Duration;

use beacon_config::{RetentionConfig, StorageBackend, StorageConfig};
use opendal::Operator;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::info;

mod alerts;
mod error;
mod lifecycle;
mod partition;
mod read;
mod schema;
mod write;

pub use error::{Result, StoreError};
pub use read::{AggregateBucket, GroupColumn, RowFilter, TimeWindow, WindowStats};
pub use schema::{batch_to_rows, metrics_schema, rows_to_batch};
pub use write::InsertReceipt;

pub struct Store {
    op: Operator,
    semaphore: Semaphore,
    acquire_timeout: Duration,
    row_group_size: usize,
    retention: RetentionConfig,
}

impl Store {
    /// Build a store from configuration, choosing the OpenDAL backend.
    pub fn from_config(storage: &StorageConfig, retention: &RetentionConfig) -> Result<Self> {
        let op = match storage.backend {
            StorageBackend::Fs => {
                let fs = storage
                    .fs
                    .as_ref()
                    .ok_or_else(|| StoreError::fatal("fs backend requires [storage.fs]"))?;
                info!(path = %fs.path, "using filesystem storage");
                let builder = opendal::services::Fs::default().root(&fs.path);
                Operator::new(builder)
                    .map_err(StoreError::from)?
                    .finish()
            }
            StorageBackend::S3 => {
                let s3 = storage
                    .s3
                    .as_ref()
                    .ok_or_else(|| StoreError::fatal("s3 backend requires [storage.s3]"))?;
                info!(bucket = %s3.bucket, region = %s3.region, "using s3 storage");
                let mut builder = opendal::services::S3::default()
                    .bucket(&s3.bucket)
                    .region(&s3.region);
                if let Some(endpoint) = &s3.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                Operator::new(builder)
                    .map_err(StoreError::from)?
                    .finish()
            }
            StorageBackend::Memory => {
                let builder = opendal::services::Memory::default();
                Operator::new(builder)
                    .map_err(StoreError::from)?
                    .finish()
            }
        };
        Ok(Self::with_operator(op, storage, retention))
    }

    /// Wrap an existing operator; used by tests to inject failing backends.
    pub fn with_operator(
        op: Operator,
        storage: &StorageConfig,
        retention: &RetentionConfig,
    ) -> Self {
        Self {
            op,
            semaphore: Semaphore::new(storage.pool_size.max(1)),
            acquire_timeout: Duration::from_millis(storage.pool_acquire_timeout_ms),
            row_group_size: storage.parquet_row_group_size,
            retention: retention.clone(),
        }
    }

    /// Bounded-concurrency guard around every storage operation. A saturated
    /// pool surfaces as retryable instead of blocking the caller forever.
    pub(crate) async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        tokio::time::timeout(self.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| StoreError::retryable("storage pool acquisition timed out"))?
            .map_err(|_| StoreError::fatal("storage pool closed"))
    }

    /// Cheap probe for readiness checks: the backend answers a list call.
    pub async fn healthy(&self) -> bool {
        self.op.list("/").await.is_ok()
    }

    pub(crate) fn retention(&self) -> &RetentionConfig {
        &self.retention
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use beacon_core::{MetricSample, MetricType, StoredRow};

    pub(crate) fn memory_store() -> Store {
        let storage = StorageConfig {
            backend: StorageBackend::Memory,
            ..StorageConfig::default()
        };
        Store::from_config(&storage, &RetentionConfig::default()).unwrap()
    }

    pub(crate) fn raw_row(id: u64, service: &str, metric: &str, ts: i64, value: f64) -> StoredRow {
        StoredRow::from_sample(
            id,
            MetricSample {
                timestamp: ts,
                service_name: service.into(),
                metric_name: metric.into(),
                metric_type: MetricType::Gauge,
                value,
                endpoint: Some("/x".into()),
                method: Some("GET".into()),
                status_code: Some(200),
                duration_ms: Some(value),
                tags: None,
                trace_id: None,
                span_id: None,
                environment: Some("prod".into()),
            },
            None,
        )
    }
}
