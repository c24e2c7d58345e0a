// Configuration validation.
//
// Catches operator mistakes at startup instead of at 3am.

use anyhow::{bail, Result};

use crate::{BeaconConfig, BusKind, StorageBackend};

pub(crate) fn validate_config(config: &BeaconConfig) -> Result<()> {
    let gw = &config.gateway;
    if gw.max_batch_size == 0 {
        bail!("gateway.max_batch_size must be at least 1");
    }
    if gw.rate_limit_rpm <= 0.0 || gw.rate_limit_capacity <= 0.0 {
        bail!("gateway rate limit settings must be positive");
    }
    if gw.auth_enabled && gw.api_keys.is_empty() {
        bail!("gateway.auth_enabled requires at least one entry in gateway.api_keys");
    }
    if gw.preagg_enabled && gw.preagg_max_keys == 0 {
        bail!("gateway.preagg_max_keys must be at least 1 when pre-aggregation is enabled");
    }

    let worker = &config.worker;
    if worker.batch_min == 0 || worker.batch_min > worker.batch_max {
        bail!(
            "worker batch bounds invalid: batch_min={} batch_max={}",
            worker.batch_min,
            worker.batch_max
        );
    }
    if !(worker.batch_min..=worker.batch_max).contains(&worker.target_batch_size) {
        bail!(
            "worker.target_batch_size {} outside [{}, {}]",
            worker.target_batch_size,
            worker.batch_min,
            worker.batch_max
        );
    }
    if worker.breaker_fail_threshold == 0 {
        bail!("worker.breaker_fail_threshold must be at least 1");
    }

    let health = &config.health;
    let weight_sum = health.error_weight + health.latency_weight + health.traffic_weight;
    if (weight_sum - 1.0).abs() > 1e-6 {
        bail!("health score weights must sum to 1.0, got {weight_sum}");
    }
    if health.lat_ref_hi_ms <= health.lat_ref_lo_ms {
        bail!("health.lat_ref_hi_ms must exceed health.lat_ref_lo_ms");
    }
    if health.err_ref <= 0.0 || health.traffic_ref <= 0.0 {
        bail!("health reference values must be positive");
    }

    let alerting = &config.alerting;
    if alerting.eval_period_s == 0 || alerting.baseline_window_s < alerting.eval_period_s {
        bail!("alerting.baseline_window_s must cover at least one eval period");
    }
    if alerting.sigma_k <= 0.0 {
        bail!("alerting.sigma_k must be positive");
    }
    if alerting.consec_breaches == 0 || alerting.consec_ok == 0 {
        bail!("alerting consecutive thresholds must be at least 1");
    }

    if config.storage.pool_size == 0 {
        bail!("storage.pool_size must be at least 1");
    }
    match config.storage.backend {
        StorageBackend::Fs => {
            if config.storage.fs.is_none() {
                bail!("storage.backend = fs requires a [storage.fs] section");
            }
        }
        StorageBackend::S3 => match &config.storage.s3 {
            None => bail!("storage.backend = s3 requires a [storage.s3] section"),
            Some(s3) if s3.bucket.is_empty() => bail!("storage.s3.bucket must not be empty"),
            _ => {}
        },
        StorageBackend::Memory => {}
    }

    if config.bus.kind == BusKind::Kafka && config.bus.brokers.is_empty() {
        bail!("bus.kind = kafka requires bus.brokers");
    }
    if config.bus.partitions == 0 {
        bail!("bus.partitions must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::BeaconConfig;

    #[test]
    fn test_auth_requires_keys() {
        let mut config = BeaconConfig::default();
        config.gateway.auth_enabled = true;
        assert!(config.validate().is_err());
        config.gateway.api_keys.push("secret".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_batch_bounds_checked() {
        let mut config = BeaconConfig::default();
        config.worker.batch_min = 500;
        config.worker.batch_max = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = BeaconConfig::default();
        config.health.error_weight = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut config = BeaconConfig::default();
        config.storage.backend = crate::StorageBackend::S3;
        assert!(config.validate().is_err());
    }
}
