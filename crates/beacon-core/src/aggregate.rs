// Pre-aggregation primitives.
//
// Samples sharing an aggregation key within the same minute collapse into one
// accumulator. Quantiles come from a fixed-capacity uniform reservoir so the
// accumulator stays O(1) in memory no matter how hot the key is.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::sample::{MetricSample, MetricType, StoredRow};

const MINUTE_MS: i64 = 60_000;

/// Default reservoir capacity for quantile estimation.
pub const RESERVOIR_CAPACITY: usize = 512;

/// Identity of a pre-aggregation bucket: service, metric, endpoint, method,
/// status code, and the minute the samples fell into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    pub service_name: String,
    pub metric_name: String,
    pub endpoint: String,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub minute_start: i64,
}

impl AggregationKey {
    /// Derive the key for a sample, or `None` when the sample cannot be
    /// aggregated (no endpoint) and must be published raw.
    pub fn of(sample: &MetricSample) -> Option<Self> {
        let endpoint = sample.endpoint.as_ref()?.clone();
        Some(Self {
            service_name: sample.service_name.clone(),
            metric_name: sample.metric_name.clone(),
            endpoint,
            method: sample.method.clone(),
            status_code: sample.status_code,
            minute_start: floor_to_minute(sample.timestamp),
        })
    }
}

/// Floor a millisecond timestamp to its minute boundary.
pub fn floor_to_minute(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(MINUTE_MS) * MINUTE_MS
}

/// Fixed-capacity uniform sample of observed values (algorithm R).
#[derive(Debug, Clone)]
pub struct Reservoir {
    values: Vec<f64>,
    seen: u64,
    capacity: usize,
    rng: StdRng,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity.min(64)),
            seen: 0,
            capacity,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.seen += 1;
        if self.values.len() < self.capacity {
            self.values.push(value);
            return;
        }
        let slot = self.rng.gen_range(0..self.seen);
        if (slot as usize) < self.capacity {
            self.values[slot as usize] = value;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Nearest-rank quantile over the sampled values. `q` in [0, 1].
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(quantile_of_sorted(&sorted, q))
    }
}

/// Nearest-rank quantile of an already sorted slice.
pub fn quantile_of_sorted(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = (q.clamp(0.0, 1.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Values accumulated under one aggregation key.
#[derive(Debug, Clone)]
pub struct Accumulator {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub error_count: u64,
    pub metric_type: MetricType,
    pub environment: Option<String>,
    reservoir: Reservoir,
}

impl Accumulator {
    pub fn new(metric_type: MetricType) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            error_count: 0,
            metric_type,
            environment: None,
            reservoir: Reservoir::new(RESERVOIR_CAPACITY),
        }
    }

    pub fn observe(&mut self, sample: &MetricSample) {
        self.count += 1;
        self.sum += sample.value;
        self.min = self.min.min(sample.value);
        self.max = self.max.max(sample.value);
        if sample.is_error() {
            self.error_count += 1;
        }
        if self.environment.is_none() {
            self.environment = sample.environment.clone();
        }
        self.reservoir.observe(sample.value);
    }

    pub fn summary(&self) -> AggregateSummary {
        AggregateSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            error_count: self.error_count,
            p50: self.reservoir.quantile(0.50),
            p95: self.reservoir.quantile(0.95),
            p99: self.reservoir.quantile(0.99),
        }
    }

    /// Collapse into one minute-resolution stored row.
    pub fn into_row(self, id: u64, key: &AggregationKey) -> StoredRow {
        let summary = self.summary();
        let avg = if summary.count > 0 {
            summary.sum / summary.count as f64
        } else {
            0.0
        };
        StoredRow {
            id,
            timestamp: key.minute_start,
            service_name: key.service_name.clone(),
            metric_name: key.metric_name.clone(),
            metric_type: self.metric_type,
            value: avg,
            endpoint: Some(key.endpoint.clone()),
            method: key.method.clone(),
            status_code: key.status_code,
            duration_ms: None,
            tags: None,
            trace_id: None,
            span_id: None,
            environment: self.environment,
            aggregated: true,
            resolution_minutes: 1,
            agg_count: Some(summary.count),
            agg_sum: Some(summary.sum),
            agg_min: Some(summary.min),
            agg_max: Some(summary.max),
            agg_error_count: Some(summary.error_count),
            agg_p50: summary.p50,
            agg_p95: summary.p95,
            agg_p99: summary.p99,
        }
    }
}

/// Finished aggregate values for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub error_count: u64,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f64, status: Option<u16>) -> MetricSample {
        MetricSample {
            timestamp: 1_700_000_012_345,
            service_name: "api".into(),
            metric_name: "http.duration".into(),
            metric_type: MetricType::Histogram,
            value,
            endpoint: Some("/users".into()),
            method: Some("GET".into()),
            status_code: status,
            duration_ms: Some(value),
            tags: None,
            trace_id: None,
            span_id: None,
            environment: Some("prod".into()),
        }
    }

    #[test]
    fn test_key_requires_endpoint() {
        let mut s = sample(1.0, Some(200));
        assert!(AggregationKey::of(&s).is_some());
        s.endpoint = None;
        assert!(AggregationKey::of(&s).is_none());
    }

    #[test]
    fn test_key_floors_to_minute() {
        let key = AggregationKey::of(&sample(1.0, Some(200))).unwrap();
        assert_eq!(key.minute_start, 1_700_000_000_000 - 1_700_000_000_000 % 60_000);
        assert_eq!(key.minute_start % 60_000, 0);
    }

    #[test]
    fn test_accumulator_counts_and_extrema() {
        let mut acc = Accumulator::new(MetricType::Histogram);
        for (v, status) in [(10.0, 200), (30.0, 500), (20.0, 503)] {
            acc.observe(&sample(v, Some(status)));
        }
        let summary = acc.summary();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.sum, 60.0);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 30.0);
        assert_eq!(summary.error_count, 2);
    }

    #[test]
    fn test_aggregated_row_shape() {
        let mut acc = Accumulator::new(MetricType::Histogram);
        acc.observe(&sample(10.0, Some(200)));
        acc.observe(&sample(20.0, Some(200)));
        let key = AggregationKey::of(&sample(10.0, Some(200))).unwrap();
        let row = acc.into_row(99, &key);
        assert!(row.aggregated);
        assert_eq!(row.resolution_minutes, 1);
        assert_eq!(row.value, 15.0);
        assert_eq!(row.agg_count, Some(2));
        assert_eq!(row.timestamp % 60_000, 0);
        assert_eq!(row.observation_count(), 2);
    }

    #[test]
    fn test_reservoir_caps_memory() {
        let mut res = Reservoir::new(16);
        for i in 0..1000 {
            res.observe(i as f64);
        }
        assert_eq!(res.len(), 16);
        let p50 = res.quantile(0.5).unwrap();
        assert!((0.0..1000.0).contains(&p50));
    }

    #[test]
    fn test_quantiles_exact_below_capacity() {
        let mut res = Reservoir::new(RESERVOIR_CAPACITY);
        for i in 1..=100 {
            res.observe(i as f64);
        }
        assert_eq!(res.quantile(0.0), Some(1.0));
        assert_eq!(res.quantile(1.0), Some(100.0));
        let p50 = res.quantile(0.5).unwrap();
        assert!((49.0..=52.0).contains(&p50));
    }
}
