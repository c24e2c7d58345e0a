// Adaptive alert evaluation.
//
// Every tick, each (service, metric) pair's latest completed minute is
// checked against a rolling baseline: bounds are mean +/- k*sigma over the
// baseline window's per-minute means, falling back to +/-20% of the mean
// when sigma collapses. Two consecutive out-of-bound evaluations open an
// alert; three consecutive in-bound evaluations resolve it. A pair that
// re-breaches after resolution gets a fresh alert id.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_config::AlertingConfig;
use beacon_core::{Alert, AlertSeverity};
use beacon_store::{RowFilter, Store, StoreError, TimeWindow};
use metrics::counter;
use parking_lot::Mutex;
use tracing::{info, warn};

const MINUTE_MS: i64 = 60_000;
/// Baselines thinner than this are not trusted.
const MIN_BASELINE_BUCKETS: usize = 5;

#[derive(Debug, Default)]
struct PairState {
    consec_breach: u32,
    consec_ok: u32,
    active: Option<Alert>,
}

pub struct AlertEngine {
    store: Arc<Store>,
    cfg: AlertingConfig,
    pairs: Mutex<HashMap<(String, String), PairState>>,
}

impl AlertEngine {
    pub fn new(store: Arc<Store>, cfg: AlertingConfig) -> Self {
        Self {
            store,
            cfg,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// One evaluation pass at `now_ms`.
    pub async fn tick(&self, now_ms: i64) -> Result<(), StoreError> {
        let discovery = TimeWindow::new(now_ms - self.cfg.baseline_window_s as i64 * 1_000, now_ms);
        let series = self.store.list_series(&discovery).await?;
        for (service, metric) in series {
            if let Err(e) = self.evaluate_pair(&service, &metric, now_ms).await {
                warn!(service = %service, metric = %metric, error = %e, "alert evaluation failed");
            }
        }
        Ok(())
    }

    async fn evaluate_pair(
        &self,
        service: &str,
        metric: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let filter = RowFilter {
            service: Some(service.to_owned()),
            metric: Some(metric.to_owned()),
            ..RowFilter::default()
        };

        // Latest completed minute.
        let current_start = (now_ms - MINUTE_MS).div_euclid(MINUTE_MS) * MINUTE_MS;
        let current_window = TimeWindow::new(current_start, current_start + MINUTE_MS);
        let Some(current) = self.store.aggregate_window(&filter, &current_window).await? else {
            // No data this minute: neither a breach nor an all-clear.
            return Ok(());
        };

        // Baseline: everything before the current minute within the window.
        let baseline_window = TimeWindow::new(
            current_start - self.cfg.baseline_window_s as i64 * 1_000,
            current_start,
        );
        let baseline = self
            .store
            .query_aggregates(&filter, &baseline_window, MINUTE_MS, None)
            .await?;
        if baseline.len() < MIN_BASELINE_BUCKETS {
            return Ok(());
        }

        let means: Vec<f64> = baseline.iter().map(|b| b.avg).collect();
        let mu = means.iter().sum::<f64>() / means.len() as f64;
        let sigma = (means.iter().map(|v| (v - mu).powi(2)).sum::<f64>()
            / (means.len() - 1).max(1) as f64)
            .sqrt();

        let (expected_min, expected_max) = if sigma < self.cfg.sigma_floor {
            (mu - 0.2 * mu.abs(), mu + 0.2 * mu.abs())
        } else {
            (mu - self.cfg.sigma_k * sigma, mu + self.cfg.sigma_k * sigma)
        };

        let value = current.avg;
        let breach = value < expected_min || value > expected_max;
        let sigma_eff = sigma.max(self.cfg.sigma_floor).max(f64::EPSILON);
        let z = (value - mu) / sigma_eff;

        enum Action {
            None,
            UpdateActive(Alert),
            ResolveAndFireNew(Alert, Alert),
            FireNew(Alert),
            Resolved(Alert),
        }

        let action = {
            let key = (service.to_owned(), metric.to_owned());
            let mut pairs = self.pairs.lock();
            let state = pairs.entry(key).or_default();

            if breach {
                state.consec_breach += 1;
                state.consec_ok = 0;

                if let Some(active) = state.active.as_mut() {
                    let stale =
                        now_ms - active.last_triggered > self.cfg.refire_dedup_s as i64 * 1_000;
                    if !stale {
                        // Within the dedup window a firing alert is updated in
                        // place, never re-created.
                        active.record_breach(
                            AlertSeverity::from_zscore(z),
                            value,
                            expected_min,
                            expected_max,
                            now_ms,
                        );
                        Action::UpdateActive(active.clone())
                    } else {
                        // The old incident went quiet without ever resolving;
                        // close it out and open a fresh one below.
                        let mut expired = active.clone();
                        expired.resolve(now_ms);
                        let alert = Alert::fire(
                            service,
                            metric,
                            AlertSeverity::from_zscore(z),
                            value,
                            expected_min,
                            expected_max,
                            now_ms,
                        );
                        state.active = Some(alert.clone());
                        Action::ResolveAndFireNew(expired, alert)
                    }
                } else if state.consec_breach >= self.cfg.consec_breaches {
                    let alert = Alert::fire(
                        service,
                        metric,
                        AlertSeverity::from_zscore(z),
                        value,
                        expected_min,
                        expected_max,
                        now_ms,
                    );
                    state.active = Some(alert.clone());
                    Action::FireNew(alert)
                } else {
                    Action::None
                }
            } else {
                state.consec_ok += 1;
                state.consec_breach = 0;

                if state.consec_ok >= self.cfg.consec_ok {
                    if let Some(mut resolved) = state.active.take() {
                        resolved.resolve(now_ms);
                        Action::Resolved(resolved)
                    } else {
                        Action::None
                    }
                } else {
                    Action::None
                }
            }
        };

        match action {
            Action::None => Ok(()),
            Action::UpdateActive(snapshot) => {
                counter!("beacon_query_alert_updates_total", 1);
                self.store.put_alert(&snapshot).await
            }
            Action::ResolveAndFireNew(expired, alert) => {
                counter!("beacon_query_alerts_fired_total", 1);
                self.store.put_alert(&expired).await?;
                self.store.put_alert(&alert).await
            }
            Action::FireNew(alert) => {
                info!(
                    service = %service,
                    metric = %metric,
                    value,
                    expected_min,
                    expected_max,
                    "alert firing"
                );
                counter!("beacon_query_alerts_fired_total", 1);
                self.store.put_alert(&alert).await
            }
            Action::Resolved(resolved) => {
                info!(
                    service = %service,
                    metric = %metric,
                    alert_id = %resolved.alert_id,
                    "alert resolved"
                );
                counter!("beacon_query_alerts_resolved_total", 1);
                self.store.put_alert(&resolved).await
            }
        }
    }

    /// Number of pairs currently tracked; exposed for tests.
    pub fn tracked_pairs(&self) -> usize {
        self.pairs.lock().len()
    }
}

/// Background evaluation loop.
pub async fn run_evaluator(engine: Arc<AlertEngine>, eval_period_s: u64) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(eval_period_s.max(1)));
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now().timestamp_millis();
        if let Err(e) = engine.tick(now).await {
            warn!(error = %e, "alert evaluation tick failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_config::{RetentionConfig, StorageBackend, StorageConfig};
    use beacon_core::{AlertStatus, MetricSample, MetricType, StoredRow};

    fn memory_store() -> Arc<Store> {
        let storage = StorageConfig {
            backend: StorageBackend::Memory,
            ..StorageConfig::default()
        };
        Arc::new(Store::from_config(&storage, &RetentionConfig::default()).unwrap())
    }

    fn row(id: u64, ts: i64, value: f64) -> StoredRow {
        StoredRow::from_sample(
            id,
            MetricSample {
                timestamp: ts,
                service_name: "api".into(),
                metric_name: "latency".into(),
                metric_type: MetricType::Gauge,
                value,
                endpoint: None,
                method: None,
                status_code: None,
                duration_ms: None,
                tags: None,
                trace_id: None,
                span_id: None,
                environment: None,
            },
            None,
        )
    }

    fn engine_config() -> AlertingConfig {
        AlertingConfig {
            baseline_window_s: 3_600,
            consec_breaches: 2,
            consec_ok: 3,
            ..AlertingConfig::default()
        }
    }

    /// Steady baseline at ~100 for `minutes` minutes ending at `end`.
    async fn seed_baseline(store: &Store, end: i64, minutes: i64) {
        let mut rows = Vec::new();
        for i in 0..minutes {
            let ts = end - (i + 1) * MINUTE_MS + 1_000;
            // Small deterministic jitter so sigma is non-zero.
            let value = 100.0 + (i % 3) as f64;
            rows.push(row(i as u64 + 1, ts, value));
        }
        store.insert_rows(&rows).await.unwrap();
    }

    #[tokio::test]
    async fn test_two_consecutive_breaches_fire_once() {
        let store = memory_store();
        let t0 = 1_700_000_000_000i64 - 1_700_000_000_000i64 % MINUTE_MS;
        seed_baseline(&store, t0, 30).await;

        // Two breaching minutes at ~10x the baseline.
        store.insert_rows(&[row(900, t0 + 1_000, 1_000.0)]).await.unwrap();
        store
            .insert_rows(&[row(901, t0 + MINUTE_MS + 1_000, 1_000.0)])
            .await
            .unwrap();

        let engine = AlertEngine::new(Arc::clone(&store), engine_config());
        // First breach evaluation: no alert yet.
        engine.tick(t0 + MINUTE_MS + 30_000).await.unwrap();
        assert!(store.active_alerts().await.unwrap().is_empty());

        // Second consecutive breach: alert fires.
        engine.tick(t0 + 2 * MINUTE_MS + 30_000).await.unwrap();
        let active = store.active_alerts().await.unwrap();
        assert_eq!(active.len(), 1);
        let alert = &active[0];
        assert_eq!(alert.service_name, "api");
        assert_eq!(alert.metric_name, "latency");
        assert_eq!(alert.status, AlertStatus::Firing);
        assert!(alert.expected_max < 1_000.0);
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_firing_alert_updates_not_duplicates() {
        let store = memory_store();
        let t0 = 1_700_000_000_000i64 - 1_700_000_000_000i64 % MINUTE_MS;
        seed_baseline(&store, t0, 30).await;
        for minute in 0..4 {
            store
                .insert_rows(&[row(900 + minute as u64, t0 + minute * MINUTE_MS + 1_000, 1_000.0)])
                .await
                .unwrap();
        }

        let engine = AlertEngine::new(Arc::clone(&store), engine_config());
        for minute in 1..=4 {
            engine.tick(t0 + minute * MINUTE_MS + 30_000).await.unwrap();
        }

        let all = store.list_alerts(100).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].threshold_breach_count >= 3);
        assert!(all[0].first_triggered <= all[0].last_triggered);
    }

    #[tokio::test]
    async fn test_resolve_after_three_ok_and_refire_new_id() {
        let store = memory_store();
        let t0 = 1_700_000_000_000i64 - 1_700_000_000_000i64 % MINUTE_MS;
        seed_baseline(&store, t0, 60).await;

        // Minutes 0,1: breach. Minutes 2,3,4: recovery. Minutes 5,6: breach.
        for (minute, value) in [
            (0i64, 1_000.0),
            (1, 1_000.0),
            (2, 100.0),
            (3, 101.0),
            (4, 102.0),
            (5, 1_000.0),
            (6, 1_000.0),
        ] {
            store
                .insert_rows(&[row(900 + minute as u64, t0 + minute * MINUTE_MS + 1_000, value)])
                .await
                .unwrap();
        }

        let engine = AlertEngine::new(Arc::clone(&store), engine_config());
        for minute in 1..=7 {
            engine.tick(t0 + minute * MINUTE_MS + 30_000).await.unwrap();
        }

        let all = store.list_alerts(100).await.unwrap();
        assert_eq!(all.len(), 2, "resolved alert plus re-fired alert");
        let firing: Vec<_> = all.iter().filter(|a| a.is_firing()).collect();
        let resolved: Vec<_> = all.iter().filter(|a| !a.is_firing()).collect();
        assert_eq!(firing.len(), 1);
        assert_eq!(resolved.len(), 1);
        assert_ne!(firing[0].alert_id, resolved[0].alert_id);
        assert!(resolved[0].resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_quiet_series_never_alerts() {
        let store = memory_store();
        let t0 = 1_700_000_000_000i64 - 1_700_000_000_000i64 % MINUTE_MS;
        seed_baseline(&store, t0 + 10 * MINUTE_MS, 40).await;

        let engine = AlertEngine::new(Arc::clone(&store), engine_config());
        for minute in 0..10 {
            engine.tick(t0 + minute * MINUTE_MS + 30_000).await.unwrap();
        }
        assert!(store.list_alerts(100).await.unwrap().is_empty());
    }
}
