// Read path: partition-pruned scans and bucketed aggregation.
//
// A scan walks the months intersecting the query window. Within each month
// it prefers raw and gateway-aggregated minute data (res 0 and 1); when a
// month has neither - retention removed it - the scan falls back to hourly
// rollups, then daily. Finer and coarser data are never mixed for the same
// month, so rollups cannot double-count surviving raw rows.
//
// Every scan deduplicates by row id; at-least-once delivery upstream means
// the same row may exist in more than one object.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use beacon_core::{quantile_of_sorted, StoredRow};
use bytes::Bytes;
use opendal::ErrorKind;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::error::{Result, StoreError};
use crate::partition::{month_dir, months_between, parse_file_min_ts};
use crate::schema::batch_to_rows;
use crate::Store;

/// Half-open interval `[start_ms, end_ms)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    /// The last `range_s` seconds ending at `now_ms`.
    pub fn last(range_s: u64, now_ms: i64) -> Self {
        Self {
            start_ms: now_ms - (range_s as i64) * 1_000,
            end_ms: now_ms,
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_ms && ts < self.end_ms
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_ms - self.start_ms).max(0)
    }
}

/// Typed query predicate. Built from whitelisted fields only; user input
/// never reaches the storage layer as text.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub service: Option<String>,
    pub metric: Option<String>,
    pub environment: Option<String>,
    pub endpoint: Option<String>,
}

impl RowFilter {
    pub fn service(name: &str) -> Self {
        Self {
            service: Some(name.to_owned()),
            ..Self::default()
        }
    }

    pub fn matches(&self, row: &StoredRow) -> bool {
        if let Some(service) = &self.service {
            if &row.service_name != service {
                return false;
            }
        }
        if let Some(metric) = &self.metric {
            if &row.metric_name != metric {
                return false;
            }
        }
        if let Some(environment) = &self.environment {
            if row.environment.as_deref() != Some(environment.as_str()) {
                return false;
            }
        }
        if let Some(endpoint) = &self.endpoint {
            if row.endpoint.as_deref() != Some(endpoint.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Columns a query may group by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupColumn {
    Endpoint,
    Method,
    StatusCode,
    Environment,
}

impl GroupColumn {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "endpoint" => Some(GroupColumn::Endpoint),
            "method" => Some(GroupColumn::Method),
            "status_code" => Some(GroupColumn::StatusCode),
            "environment" => Some(GroupColumn::Environment),
            _ => None,
        }
    }

    fn value_of(&self, row: &StoredRow) -> String {
        match self {
            GroupColumn::Endpoint => row.endpoint.clone(),
            GroupColumn::Method => row.method.clone(),
            GroupColumn::StatusCode => row.status_code.map(|c| c.to_string()),
            GroupColumn::Environment => row.environment.clone(),
        }
        .unwrap_or_else(|| "unknown".to_string())
    }
}

/// One aggregated output bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateBucket {
    pub bucket_start: i64,
    pub group: Option<String>,
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub error_count: u64,
}

/// Request-level stats for one service window, feeding health scores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowStats {
    pub request_count: u64,
    pub error_count: u64,
    pub p95_latency_ms: Option<f64>,
}

/// Merges raw observations and pre-aggregated summaries into one bucket.
/// Quantiles combine the exact estimate over raw values with the
/// count-weighted mean of stored rollup quantiles.
#[derive(Debug, Default)]
pub(crate) struct Merge {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    error_count: u64,
    raw_values: Vec<f64>,
    weight: f64,
    wp50: f64,
    wp95: f64,
    wp99: f64,
}

impl Merge {
    pub(crate) fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            ..Self::default()
        }
    }

    pub(crate) fn add_row(&mut self, row: &StoredRow) {
        if row.aggregated {
            let count = row.agg_count.unwrap_or(1);
            self.count += count;
            self.sum += row.agg_sum.unwrap_or(row.value * count as f64);
            self.min = self.min.min(row.agg_min.unwrap_or(row.value));
            self.max = self.max.max(row.agg_max.unwrap_or(row.value));
            self.error_count += row.agg_error_count.unwrap_or(0);
            let weight = count as f64;
            self.weight += weight;
            self.wp50 += weight * row.agg_p50.unwrap_or(row.value);
            self.wp95 += weight * row.agg_p95.unwrap_or(row.value);
            self.wp99 += weight * row.agg_p99.unwrap_or(row.value);
        } else {
            self.count += 1;
            self.sum += row.value;
            self.min = self.min.min(row.value);
            self.max = self.max.max(row.value);
            if row.status_code.is_some_and(|c| c >= 500) {
                self.error_count += 1;
            }
            self.raw_values.push(row.value);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn quantile(&self, q: f64, weighted_sum: f64) -> f64 {
        let raw_n = self.raw_values.len() as f64;
        let raw_part = if self.raw_values.is_empty() {
            None
        } else {
            let mut sorted = self.raw_values.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            Some(quantile_of_sorted(&sorted, q))
        };
        match (raw_part, self.weight > 0.0) {
            (Some(raw), true) => (raw * raw_n + weighted_sum) / (raw_n + self.weight),
            (Some(raw), false) => raw,
            (None, true) => weighted_sum / self.weight,
            (None, false) => 0.0,
        }
    }

    pub(crate) fn finish(self, bucket_start: i64, group: Option<String>) -> AggregateBucket {
        let avg = if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        };
        let p50 = self.quantile(0.50, self.wp50);
        let p95 = self.quantile(0.95, self.wp95);
        let p99 = self.quantile(0.99, self.wp99);
        AggregateBucket {
            bucket_start,
            group,
            count: self.count,
            avg,
            min: if self.min.is_finite() { self.min } else { 0.0 },
            max: if self.max.is_finite() { self.max } else { 0.0 },
            p50,
            p95,
            p99,
            error_count: self.error_count,
        }
    }
}

fn is_latency_metric(name: &str) -> bool {
    name.contains("duration") || name.contains("latency") || name.ends_with("_ms")
}

impl Store {
    /// Rows matching `filter` within `window`, ascending by timestamp,
    /// truncated to `limit`.
    pub async fn query_range(
        &self,
        filter: &RowFilter,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        let mut rows = self.scan_fine_or_rollup(filter, window).await?;
        rows.sort_by_key(|r| (r.timestamp, r.id));
        rows.truncate(limit);
        Ok(rows)
    }

    /// Time-bucketed aggregates, optionally split by a group column.
    pub async fn query_aggregates(
        &self,
        filter: &RowFilter,
        window: &TimeWindow,
        bucket_ms: i64,
        group: Option<GroupColumn>,
    ) -> Result<Vec<AggregateBucket>> {
        let bucket_ms = bucket_ms.max(1);
        let rows = self.scan_fine_or_rollup(filter, window).await?;
        let mut buckets: BTreeMap<(i64, Option<String>), Merge> = BTreeMap::new();
        for row in &rows {
            let bucket_start = row.timestamp.div_euclid(bucket_ms) * bucket_ms;
            let key = (bucket_start, group.map(|g| g.value_of(row)));
            buckets.entry(key).or_insert_with(Merge::new).add_row(row);
        }
        Ok(buckets
            .into_iter()
            .map(|((bucket_start, group), merge)| merge.finish(bucket_start, group))
            .collect())
    }

    /// One aggregate across the whole window, or `None` when it is empty.
    pub async fn aggregate_window(
        &self,
        filter: &RowFilter,
        window: &TimeWindow,
    ) -> Result<Option<AggregateBucket>> {
        let rows = self.scan_fine_or_rollup(filter, window).await?;
        let mut merge = Merge::new();
        for row in &rows {
            merge.add_row(row);
        }
        if merge.is_empty() {
            return Ok(None);
        }
        Ok(Some(merge.finish(window.start_ms, None)))
    }

    /// Distinct service names seen within the window.
    pub async fn list_services(&self, window: &TimeWindow) -> Result<Vec<String>> {
        let rows = self
            .scan_fine_or_rollup(&RowFilter::default(), window)
            .await?;
        let set: BTreeSet<String> = rows.into_iter().map(|r| r.service_name).collect();
        Ok(set.into_iter().collect())
    }

    /// Distinct (service, metric) pairs within the window.
    pub async fn list_series(&self, window: &TimeWindow) -> Result<Vec<(String, String)>> {
        let rows = self
            .scan_fine_or_rollup(&RowFilter::default(), window)
            .await?;
        let set: BTreeSet<(String, String)> = rows
            .into_iter()
            .map(|r| (r.service_name, r.metric_name))
            .collect();
        Ok(set.into_iter().collect())
    }

    /// Request/error/latency stats for one service window.
    ///
    /// Latency prefers explicit `duration_ms`; for pre-aggregated rows the
    /// stored p95 of duration-like metrics stands in.
    pub async fn service_window_stats(
        &self,
        service: &str,
        window: &TimeWindow,
    ) -> Result<WindowStats> {
        let rows = self
            .scan_fine_or_rollup(&RowFilter::service(service), window)
            .await?;

        let mut stats = WindowStats::default();
        let mut latencies: Vec<f64> = Vec::new();
        let mut weighted_p95 = 0.0f64;
        let mut weighted_n = 0.0f64;

        for row in &rows {
            if row.status_code.is_some() {
                stats.request_count += row.observation_count();
            }
            if row.aggregated {
                stats.error_count += row.agg_error_count.unwrap_or(0);
                if is_latency_metric(&row.metric_name) {
                    if let (Some(p95), Some(count)) = (row.agg_p95, row.agg_count) {
                        weighted_p95 += p95 * count as f64;
                        weighted_n += count as f64;
                    }
                }
            } else {
                if row.status_code.is_some_and(|c| c >= 500) {
                    stats.error_count += 1;
                }
                if let Some(duration) = row.duration_ms {
                    latencies.push(duration);
                } else if is_latency_metric(&row.metric_name) {
                    latencies.push(row.value);
                }
            }
        }

        stats.p95_latency_ms = if !latencies.is_empty() {
            latencies.sort_by(|a, b| a.total_cmp(b));
            let exact = quantile_of_sorted(&latencies, 0.95);
            if weighted_n > 0.0 {
                let n = latencies.len() as f64;
                Some((exact * n + weighted_p95) / (n + weighted_n))
            } else {
                Some(exact)
            }
        } else if weighted_n > 0.0 {
            Some(weighted_p95 / weighted_n)
        } else {
            None
        };

        Ok(stats)
    }

    /// Scan one resolution only; used by rollup materialization.
    pub(crate) async fn scan_resolutions(
        &self,
        resolutions: &[u16],
        filter: &RowFilter,
        window: &TimeWindow,
    ) -> Result<Vec<StoredRow>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (year, month) in months_between(window.start_ms, window.end_ms) {
            for &resolution in resolutions {
                self.scan_month(resolution, year, month, filter, window, &mut seen, &mut out)
                    .await?;
            }
        }
        Ok(out)
    }

    /// Month-by-month scan with retention fallback: res {0, 1}, else 60,
    /// else 1440.
    async fn scan_fine_or_rollup(
        &self,
        filter: &RowFilter,
        window: &TimeWindow,
    ) -> Result<Vec<StoredRow>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (year, month) in months_between(window.start_ms, window.end_ms) {
            let before = out.len();
            for resolution in [0u16, 1] {
                self.scan_month(resolution, year, month, filter, window, &mut seen, &mut out)
                    .await?;
            }
            if out.len() > before {
                continue;
            }
            self.scan_month(60, year, month, filter, window, &mut seen, &mut out)
                .await?;
            if out.len() > before {
                continue;
            }
            self.scan_month(1440, year, month, filter, window, &mut seen, &mut out)
                .await?;
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan_month(
        &self,
        resolution: u16,
        year: i32,
        month: u32,
        filter: &RowFilter,
        window: &TimeWindow,
        seen: &mut HashSet<u64>,
        out: &mut Vec<StoredRow>,
    ) -> Result<()> {
        let dir = month_dir(resolution, year, month);
        for entry in self.list_dir(&dir).await? {
            let name = entry.name();
            if !name.ends_with(".parquet") {
                continue;
            }
            if let Some(min_ts) = parse_file_min_ts(name) {
                if min_ts >= window.end_ms {
                    continue;
                }
            }
            let bytes = self.read_object(entry.path()).await?;
            let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?
                .with_batch_size(8_192)
                .build()?;
            for batch in reader {
                let batch = batch.map_err(StoreError::from)?;
                for row in batch_to_rows(&batch)? {
                    if window.contains(row.timestamp)
                        && filter.matches(&row)
                        && seen.insert(row.id)
                    {
                        out.push(row);
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn list_dir(&self, dir: &str) -> Result<Vec<opendal::Entry>> {
        match self.op.list(dir).await {
            Ok(entries) => Ok(entries),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_object(&self, path: &str) -> Result<Bytes> {
        let _permit = self.permit().await?;
        let buffer = self.op.read(path).await?;
        Ok(buffer.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{memory_store, raw_row};

    const T0: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_range_query_filters_sorts_and_limits() {
        let store = memory_store();
        let rows = vec![
            raw_row(3, "api", "m", T0 + 2_000, 3.0),
            raw_row(1, "api", "m", T0, 1.0),
            raw_row(2, "web", "m", T0 + 1_000, 2.0),
            raw_row(4, "api", "m", T0 + 3_000, 4.0),
        ];
        store.insert_rows(&rows).await.unwrap();

        let window = TimeWindow::new(T0, T0 + 10_000);
        let got = store
            .query_range(&RowFilter::service("api"), &window, 2)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, 1);
        assert_eq!(got[1].id, 3);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_deduped_on_read() {
        let store = memory_store();
        let row = raw_row(42, "api", "m", T0, 7.0);
        // Same row delivered twice under different batching.
        store.insert_rows(&[row.clone()]).await.unwrap();
        store
            .insert_rows(&[row.clone(), raw_row(43, "api", "m", T0 + 1, 8.0)])
            .await
            .unwrap();

        let window = TimeWindow::new(T0, T0 + 10_000);
        let got = store
            .query_range(&RowFilter::service("api"), &window, 100)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);

        let agg = store
            .aggregate_window(&RowFilter::service("api"), &window)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.avg, 7.5);
    }

    #[tokio::test]
    async fn test_aggregate_window_values() {
        let store = memory_store();
        let mut rows = Vec::new();
        for (i, v) in [10.0, 20.0, 30.0, 40.0].iter().enumerate() {
            rows.push(raw_row(i as u64 + 1, "api", "m", T0 + i as i64 * 1_000, *v));
        }
        // One server error.
        rows[3].status_code = Some(503);
        store.insert_rows(&rows).await.unwrap();

        let agg = store
            .aggregate_window(
                &RowFilter::service("api"),
                &TimeWindow::new(T0, T0 + 60_000),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agg.count, 4);
        assert_eq!(agg.avg, 25.0);
        assert_eq!(agg.min, 10.0);
        assert_eq!(agg.max, 40.0);
        assert_eq!(agg.error_count, 1);
    }

    #[tokio::test]
    async fn test_bucketed_aggregates_align_to_epoch() {
        let store = memory_store();
        let minute = 60_000i64;
        let base = T0 - T0.rem_euclid(minute);
        let rows = vec![
            raw_row(1, "api", "m", base + 1_000, 10.0),
            raw_row(2, "api", "m", base + 2_000, 20.0),
            raw_row(3, "api", "m", base + minute + 1_000, 30.0),
        ];
        store.insert_rows(&rows).await.unwrap();

        let buckets = store
            .query_aggregates(
                &RowFilter::service("api"),
                &TimeWindow::new(base, base + 2 * minute),
                minute,
                None,
            )
            .await
            .unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, base);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].avg, 15.0);
        assert_eq!(buckets[1].bucket_start, base + minute);
        assert_eq!(buckets[1].count, 1);
    }

    #[tokio::test]
    async fn test_group_by_endpoint() {
        let store = memory_store();
        let mut a = raw_row(1, "api", "m", T0, 1.0);
        a.endpoint = Some("/users".into());
        let mut b = raw_row(2, "api", "m", T0 + 1, 3.0);
        b.endpoint = Some("/orders".into());
        store.insert_rows(&[a, b]).await.unwrap();

        let buckets = store
            .query_aggregates(
                &RowFilter::service("api"),
                &TimeWindow::new(T0, T0 + 60_000),
                86_400_000,
                Some(GroupColumn::Endpoint),
            )
            .await
            .unwrap();
        assert_eq!(buckets.len(), 2);
        let groups: Vec<_> = buckets.iter().map(|b| b.group.clone().unwrap()).collect();
        assert!(groups.contains(&"/users".to_string()));
        assert!(groups.contains(&"/orders".to_string()));
    }

    #[tokio::test]
    async fn test_aggregated_rows_merge_with_raw() {
        let store = memory_store();
        let mut agg = raw_row(10, "api", "m", T0, 15.0);
        agg.aggregated = true;
        agg.resolution_minutes = 1;
        agg.agg_count = Some(3);
        agg.agg_sum = Some(45.0);
        agg.agg_min = Some(10.0);
        agg.agg_max = Some(20.0);
        agg.agg_error_count = Some(1);
        agg.agg_p50 = Some(15.0);
        agg.agg_p95 = Some(20.0);
        agg.agg_p99 = Some(20.0);
        let raw = raw_row(11, "api", "m", T0 + 1, 5.0);
        store.insert_rows(&[agg, raw]).await.unwrap();

        let out = store
            .aggregate_window(
                &RowFilter::service("api"),
                &TimeWindow::new(T0, T0 + 60_000),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.count, 4);
        assert_eq!(out.min, 5.0);
        assert_eq!(out.max, 20.0);
        assert_eq!(out.error_count, 1);
        assert_eq!(out.avg, 12.5);
    }

    #[tokio::test]
    async fn test_list_services_and_series() {
        let store = memory_store();
        store
            .insert_rows(&[
                raw_row(1, "api", "m1", T0, 1.0),
                raw_row(2, "web", "m2", T0, 1.0),
                raw_row(3, "api", "m2", T0, 1.0),
            ])
            .await
            .unwrap();
        let window = TimeWindow::new(T0 - 1_000, T0 + 1_000);
        assert_eq!(store.list_services(&window).await.unwrap(), vec!["api", "web"]);
        assert_eq!(
            store.list_series(&window).await.unwrap(),
            vec![
                ("api".to_string(), "m1".to_string()),
                ("api".to_string(), "m2".to_string()),
                ("web".to_string(), "m2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_window_stats() {
        let store = memory_store();
        let mut rows = Vec::new();
        for i in 0..10u64 {
            let mut r = raw_row(i + 1, "api", "http.duration", T0 + i as i64, (i + 1) as f64);
            r.duration_ms = Some((i + 1) as f64 * 10.0);
            r.status_code = Some(if i < 2 { 500 } else { 200 });
            rows.push(r);
        }
        store.insert_rows(&rows).await.unwrap();

        let stats = store
            .service_window_stats("api", &TimeWindow::new(T0, T0 + 60_000))
            .await
            .unwrap();
        assert_eq!(stats.request_count, 10);
        assert_eq!(stats.error_count, 2);
        let p95 = stats.p95_latency_ms.unwrap();
        assert!((90.0..=100.0).contains(&p95));
    }

    #[tokio::test]
    async fn test_empty_window_returns_none() {
        let store = memory_store();
        let out = store
            .aggregate_window(
                &RowFilter::service("ghost"),
                &TimeWindow::new(T0, T0 + 1_000),
            )
            .await
            .unwrap();
        assert!(out.is_none());
    }
}
