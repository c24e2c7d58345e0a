// Per-service health scoring.
//
// A pure function of one window's request stats; the same inputs always
// produce the same score. Reference points (error-rate ceiling, latency
// band, traffic norm) and the component weights come from configuration.

use beacon_config::HealthConfig;
use beacon_store::WindowStats;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    pub service_name: String,
    pub overall_score: f64,
    pub error_rate_score: f64,
    pub latency_score: f64,
    pub traffic_score: f64,
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    pub request_count: u64,
    pub status: &'static str,
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

pub fn compute(cfg: &HealthConfig, service: &str, stats: &WindowStats) -> HealthScore {
    let request_count = stats.request_count;
    let error_rate = stats.error_count as f64 / (request_count.max(1)) as f64;
    let error_rate_score = 100.0 * (1.0 - clamp01(error_rate / cfg.err_ref));

    let p95 = stats.p95_latency_ms.unwrap_or(0.0);
    let latency_score = 100.0
        * (1.0 - clamp01((p95 - cfg.lat_ref_lo_ms) / (cfg.lat_ref_hi_ms - cfg.lat_ref_lo_ms)));

    let traffic_score = 100.0
        * clamp01((1.0 + request_count as f64).log10() / (1.0 + cfg.traffic_ref).log10());

    let overall_score = (cfg.error_weight * error_rate_score
        + cfg.latency_weight * latency_score
        + cfg.traffic_weight * traffic_score)
        .clamp(0.0, 100.0);

    HealthScore {
        service_name: service.to_owned(),
        overall_score,
        error_rate_score,
        latency_score,
        traffic_score,
        error_rate,
        p95_latency_ms: p95,
        request_count,
        status: status_band(overall_score),
    }
}

fn status_band(overall: f64) -> &'static str {
    if overall >= 80.0 {
        "healthy"
    } else if overall >= 50.0 {
        "warning"
    } else {
        "critical"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(requests: u64, errors: u64, p95: Option<f64>) -> WindowStats {
        WindowStats {
            request_count: requests,
            error_count: errors,
            p95_latency_ms: p95,
        }
    }

    #[test]
    fn test_clean_fast_service_scores_error_and_latency_perfectly() {
        let cfg = HealthConfig::default();
        let score = compute(&cfg, "api", &stats(10_000, 0, Some(50.0)));
        assert_eq!(score.error_rate_score, 100.0);
        assert_eq!(score.latency_score, 100.0);
        assert!(score.traffic_score > 99.0);
        assert!(score.overall_score > 99.0);
        assert_eq!(score.status, "healthy");
    }

    #[test]
    fn test_error_rate_saturates_at_reference() {
        let cfg = HealthConfig::default();
        // 10% errors, double the 5% reference: component bottoms out.
        let score = compute(&cfg, "api", &stats(1_000, 100, Some(50.0)));
        assert_eq!(score.error_rate_score, 0.0);
        assert!((score.error_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_latency_interpolates_between_references() {
        let cfg = HealthConfig::default();
        // Midpoint of the 100..1000ms band.
        let score = compute(&cfg, "api", &stats(1_000, 0, Some(550.0)));
        assert!((score.latency_score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_traffic_is_critical() {
        let cfg = HealthConfig::default();
        let score = compute(&cfg, "api", &stats(0, 0, None));
        assert_eq!(score.traffic_score, 0.0);
        // 0.5*100 + 0.3*100 + 0.2*0 = 80: still counts as healthy on the
        // error/latency axes alone.
        assert_eq!(score.overall_score, 80.0);
        assert_eq!(score.status, "healthy");
    }

    #[test]
    fn test_status_bands() {
        assert_eq!(status_band(80.0), "healthy");
        assert_eq!(status_band(79.9), "warning");
        assert_eq!(status_band(50.0), "warning");
        assert_eq!(status_band(49.9), "critical");
    }

    #[test]
    fn test_pure_function_same_input_same_output() {
        let cfg = HealthConfig::default();
        let input = stats(123, 7, Some(321.5));
        assert_eq!(compute(&cfg, "api", &input), compute(&cfg, "api", &input));
    }
}
