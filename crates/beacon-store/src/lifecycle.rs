// Rollup materialization and retention.
//
// Rollups re-aggregate finer rows into coarser buckets: hourly (res 60)
// from raw and gateway minutes, daily (res 1440) from hourly. Rollup row
// ids are derived from the group key, so re-materializing the same window
// yields the same ids and duplicate runs collapse on read.
//
// Retention deletes whole month partitions once every timestamp they can
// contain has aged out.

use std::collections::BTreeMap;

use beacon_core::{MetricType, StoredRow};
use tracing::{debug, info};

use crate::error::Result;
use crate::partition::{month_end_ms, parse_month_segment, resolution_dir};
use crate::read::{Merge, RowFilter, TimeWindow};
use crate::Store;

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RollupKey {
    service_name: String,
    metric_name: String,
    endpoint: Option<String>,
    method: Option<String>,
    status_code: Option<u16>,
    environment: Option<String>,
    bucket_start: i64,
}

impl RollupKey {
    fn of(row: &StoredRow, bucket_ms: i64) -> Self {
        Self {
            service_name: row.service_name.clone(),
            metric_name: row.metric_name.clone(),
            endpoint: row.endpoint.clone(),
            method: row.method.clone(),
            status_code: row.status_code,
            environment: row.environment.clone(),
            bucket_start: row.timestamp.div_euclid(bucket_ms) * bucket_ms,
        }
    }

    /// Stable id so repeated materialization of the same bucket dedupes.
    fn row_id(&self, resolution: u16) -> u64 {
        let key = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            resolution,
            self.service_name,
            self.metric_name,
            self.endpoint.as_deref().unwrap_or(""),
            self.method.as_deref().unwrap_or(""),
            self.status_code.map(|c| c.to_string()).unwrap_or_default(),
            self.environment.as_deref().unwrap_or(""),
            self.bucket_start,
        );
        let hash = blake3::hash(key.as_bytes());
        u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("blake3 is 32 bytes"))
    }
}

impl Store {
    /// Materialize rollup rows at `target_resolution` minutes for `window`.
    /// Returns the number of rollup rows written.
    pub async fn materialize_rollup(
        &self,
        target_resolution: u16,
        window: &TimeWindow,
    ) -> Result<usize> {
        let sources: &[u16] = match target_resolution {
            60 => &[0, 1],
            1440 => &[60],
            _ => &[0, 1],
        };
        let bucket_ms = i64::from(target_resolution) * 60_000;
        let rows = self
            .scan_resolutions(sources, &RowFilter::default(), window)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut groups: BTreeMap<RollupKey, (MetricType, Merge)> = BTreeMap::new();
        for row in &rows {
            let key = RollupKey::of(row, bucket_ms);
            let entry = groups
                .entry(key)
                .or_insert_with(|| (row.metric_type, Merge::new()));
            entry.1.add_row(row);
        }

        let mut out = Vec::with_capacity(groups.len());
        for (key, (metric_type, merge)) in groups {
            let id = key.row_id(target_resolution);
            let bucket = merge.finish(key.bucket_start, None);
            out.push(StoredRow {
                id,
                timestamp: key.bucket_start,
                service_name: key.service_name,
                metric_name: key.metric_name,
                metric_type,
                value: bucket.avg,
                endpoint: key.endpoint,
                method: key.method,
                status_code: key.status_code,
                duration_ms: None,
                tags: None,
                trace_id: None,
                span_id: None,
                environment: key.environment,
                aggregated: true,
                resolution_minutes: target_resolution,
                agg_count: Some(bucket.count),
                agg_sum: Some(bucket.avg * bucket.count as f64),
                agg_min: Some(bucket.min),
                agg_max: Some(bucket.max),
                agg_error_count: Some(bucket.error_count),
                agg_p50: Some(bucket.p50),
                agg_p95: Some(bucket.p95),
                agg_p99: Some(bucket.p99),
            });
        }

        let written = out.len();
        self.insert_rows(&out).await?;
        info!(
            resolution = target_resolution,
            rows = written,
            "materialized rollup"
        );
        Ok(written)
    }

    /// Delete month partitions wholly past their retention horizon.
    /// Returns the removed partition paths.
    pub async fn enforce_retention(&self, now_ms: i64) -> Result<Vec<String>> {
        let retention = self.retention().clone();
        let horizons: [(u16, u32); 4] = [
            (0, retention.raw_days),
            (1, retention.raw_days),
            (60, retention.hourly_days),
            (1440, retention.daily_days),
        ];

        let mut removed = Vec::new();
        for (resolution, days) in horizons {
            let cutoff = now_ms - i64::from(days) * DAY_MS;
            for entry in self.list_dir(&resolution_dir(resolution)).await? {
                let Some((year, month)) = parse_month_segment(entry.name()) else {
                    continue;
                };
                if month_end_ms(year, month) <= cutoff {
                    let _permit = self.permit().await?;
                    self.op.remove_all(entry.path()).await?;
                    debug!(path = entry.path(), "removed expired partition");
                    removed.push(entry.path().to_string());
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{memory_store, raw_row};

    const HOUR_MS: i64 = 3_600_000;
    const T0: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_hourly_rollup_preserves_totals() {
        let store = memory_store();
        let hour_start = T0 - T0.rem_euclid(HOUR_MS);
        let mut rows = Vec::new();
        for i in 0..6u64 {
            rows.push(raw_row(
                i + 1,
                "api",
                "http.duration",
                hour_start + i as i64 * 60_000,
                (i + 1) as f64 * 10.0,
            ));
        }
        store.insert_rows(&rows).await.unwrap();

        let window = TimeWindow::new(hour_start, hour_start + HOUR_MS);
        let written = store.materialize_rollup(60, &window).await.unwrap();
        assert_eq!(written, 1);

        let rollups = store
            .scan_resolutions(&[60], &RowFilter::default(), &window)
            .await
            .unwrap();
        assert_eq!(rollups.len(), 1);
        let rollup = &rollups[0];
        assert!(rollup.aggregated);
        assert_eq!(rollup.resolution_minutes, 60);
        assert_eq!(rollup.agg_count, Some(6));
        assert_eq!(rollup.agg_sum, Some(210.0));
        assert_eq!(rollup.agg_min, Some(10.0));
        assert_eq!(rollup.agg_max, Some(60.0));
        assert_eq!(rollup.agg_error_count, Some(0));
        assert_eq!(rollup.timestamp, hour_start);
    }

    #[tokio::test]
    async fn test_rollup_splits_on_status_code() {
        let store = memory_store();
        let hour_start = T0 - T0.rem_euclid(HOUR_MS);
        let mut ok = raw_row(1, "api", "http.duration", hour_start + 60_000, 10.0);
        ok.status_code = Some(200);
        let mut err = raw_row(2, "api", "http.duration", hour_start + 120_000, 20.0);
        err.status_code = Some(500);
        store.insert_rows(&[ok, err]).await.unwrap();

        let window = TimeWindow::new(hour_start, hour_start + HOUR_MS);
        assert_eq!(store.materialize_rollup(60, &window).await.unwrap(), 2);

        let rollups = store
            .scan_resolutions(&[60], &RowFilter::default(), &window)
            .await
            .unwrap();
        let errors: u64 = rollups.iter().filter_map(|r| r.agg_error_count).sum();
        let total: u64 = rollups.iter().filter_map(|r| r.agg_count).sum();
        assert_eq!(total, 2);
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_rollup_rematerialization_dedupes() {
        let store = memory_store();
        let hour_start = T0 - T0.rem_euclid(HOUR_MS);
        store
            .insert_rows(&[raw_row(1, "api", "m", hour_start + 1_000, 5.0)])
            .await
            .unwrap();

        let window = TimeWindow::new(hour_start, hour_start + HOUR_MS);
        store.materialize_rollup(60, &window).await.unwrap();
        store.materialize_rollup(60, &window).await.unwrap();

        let rollups = store
            .scan_resolutions(&[60], &RowFilter::default(), &window)
            .await
            .unwrap();
        // Same id both runs -> deduped on read.
        assert_eq!(rollups.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_window_rolls_nothing() {
        let store = memory_store();
        let window = TimeWindow::new(T0, T0 + HOUR_MS);
        assert_eq!(store.materialize_rollup(60, &window).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retention_removes_expired_months() {
        let store = memory_store();
        store
            .insert_rows(&[raw_row(1, "api", "m", T0, 1.0)])
            .await
            .unwrap();

        // Two years later everything raw has expired.
        let removed = store
            .enforce_retention(T0 + 2 * 365 * DAY_MS)
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].contains("res=0/"));

        let window = TimeWindow::new(T0 - 1_000, T0 + 1_000);
        let rows = store
            .scan_resolutions(&[0], &RowFilter::default(), &window)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_retention_keeps_recent_months() {
        let store = memory_store();
        store
            .insert_rows(&[raw_row(1, "api", "m", T0, 1.0)])
            .await
            .unwrap();
        let removed = store.enforce_retention(T0 + DAY_MS).await.unwrap();
        assert!(removed.is_empty());
    }
}
