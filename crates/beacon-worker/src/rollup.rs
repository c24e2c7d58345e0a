// Rollup and retention schedule.
//
// Every interval (hourly by default) the worker re-aggregates the previous
// completed hour into res=60 rows and the previous completed day into
// res=1440 rows, then sweeps expired month partitions. Rollup ids are
// deterministic, so a tick that repeats work is harmless.

use std::sync::Arc;
use std::time::Duration;

use beacon_store::{Store, TimeWindow};
use chrono::Utc;
use metrics::counter;
use tracing::{info, warn};

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

pub async fn run_maintenance(store: Arc<Store>, interval_s: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_s.max(60)));
    loop {
        ticker.tick().await;
        run_maintenance_once(&store, Utc::now().timestamp_millis()).await;
    }
}

/// One maintenance pass at `now_ms`; separated for tests.
pub async fn run_maintenance_once(store: &Store, now_ms: i64) {
    let hour_end = now_ms.div_euclid(HOUR_MS) * HOUR_MS;
    let hourly = TimeWindow::new(hour_end - HOUR_MS, hour_end);
    match store.materialize_rollup(60, &hourly).await {
        Ok(rows) => {
            if rows > 0 {
                counter!("beacon_worker_rollup_rows_total", rows as u64, "resolution" => "60");
            }
        }
        Err(e) => warn!(error = %e, "hourly rollup failed"),
    }

    let day_end = now_ms.div_euclid(DAY_MS) * DAY_MS;
    let daily = TimeWindow::new(day_end - DAY_MS, day_end);
    match store.materialize_rollup(1440, &daily).await {
        Ok(rows) => {
            if rows > 0 {
                counter!("beacon_worker_rollup_rows_total", rows as u64, "resolution" => "1440");
            }
        }
        Err(e) => warn!(error = %e, "daily rollup failed"),
    }

    match store.enforce_retention(now_ms).await {
        Ok(removed) if !removed.is_empty() => {
            info!(partitions = removed.len(), "retention removed expired partitions");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "retention sweep failed"),
    }
}
