// Cohort comparison with Welch's t-test.
//
// Both services are reduced to per-minute bucket means over the requested
// window; the test runs on those bucket means. Significance requires
// p < 0.05 and at least 30 buckets on each side.

use beacon_core::quantile_of_sorted;
use beacon_store::{RowFilter, Store, StoreError, TimeWindow};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

const MINUTE_MS: i64 = 60_000;
const MIN_BUCKETS: usize = 30;
const ALPHA: f64 = 0.05;

#[derive(Debug, Clone, Deserialize)]
pub struct CompareRequest {
    pub baseline_service: String,
    pub candidate_service: String,
    pub metric_name: String,
    pub time_start: i64,
    pub time_end: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideStats {
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub baseline: SideStats,
    pub candidate: SideStats,
    pub improvement_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    pub significant: bool,
    pub recommendation: &'static str,
}

async fn bucket_means(
    store: &Store,
    service: &str,
    metric: &str,
    window: &TimeWindow,
) -> Result<Vec<f64>, StoreError> {
    let filter = RowFilter {
        service: Some(service.to_owned()),
        metric: Some(metric.to_owned()),
        ..RowFilter::default()
    };
    let buckets = store
        .query_aggregates(&filter, window, MINUTE_MS, None)
        .await?;
    Ok(buckets.into_iter().map(|b| b.avg).collect())
}

fn side_stats(series: &[f64]) -> SideStats {
    if series.is_empty() {
        return SideStats {
            mean: 0.0,
            p50: 0.0,
            p95: 0.0,
            p99: 0.0,
            count: 0,
        };
    }
    let mut sorted = series.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    SideStats {
        mean: series.iter().sum::<f64>() / series.len() as f64,
        p50: quantile_of_sorted(&sorted, 0.50),
        p95: quantile_of_sorted(&sorted, 0.95),
        p99: quantile_of_sorted(&sorted, 0.99),
        count: series.len(),
    }
}

fn sample_variance(series: &[f64], mean: f64) -> f64 {
    if series.len() < 2 {
        return 0.0;
    }
    series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (series.len() - 1) as f64
}

/// Two-sided p-value of Welch's two-sample t-test.
pub fn welch_p_value(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() < 2 || b.len() < 2 {
        return None;
    }
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let m1 = a.iter().sum::<f64>() / n1;
    let m2 = b.iter().sum::<f64>() / n2;
    let v1 = sample_variance(a, m1);
    let v2 = sample_variance(b, m2);
    let se2 = v1 / n1 + v2 / n2;
    if se2 <= 0.0 {
        // Degenerate: zero variance on both sides.
        return Some(if (m1 - m2).abs() < f64::EPSILON { 1.0 } else { 0.0 });
    }
    let t = (m1 - m2) / se2.sqrt();
    let df = se2.powi(2)
        / ((v1 / n1).powi(2) / (n1 - 1.0) + (v2 / n2).powi(2) / (n2 - 1.0));
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some(2.0 * (1.0 - dist.cdf(t.abs())))
}

/// Compare a candidate service against a baseline over a time window.
pub async fn compare_services(
    store: &Store,
    request: &CompareRequest,
) -> Result<Comparison, StoreError> {
    let window = TimeWindow::new(request.time_start, request.time_end);
    let baseline_series =
        bucket_means(store, &request.baseline_service, &request.metric_name, &window).await?;
    let candidate_series =
        bucket_means(store, &request.candidate_service, &request.metric_name, &window).await?;

    let baseline = side_stats(&baseline_series);
    let candidate = side_stats(&candidate_series);

    let improvement_pct = if baseline.mean.abs() > f64::EPSILON {
        (baseline.mean - candidate.mean) / baseline.mean * 100.0
    } else {
        0.0
    };

    let p_value = welch_p_value(&baseline_series, &candidate_series);
    let significant = p_value.is_some_and(|p| p < ALPHA)
        && baseline.count >= MIN_BUCKETS
        && candidate.count >= MIN_BUCKETS;

    let recommendation = if significant && improvement_pct > 0.0 {
        "deploy"
    } else if significant && improvement_pct < 0.0 {
        "reject"
    } else {
        "hold"
    };

    Ok(Comparison {
        baseline,
        candidate,
        improvement_pct,
        p_value,
        significant,
        recommendation,
    })
}
