// beacon-config - unified configuration for all beacon processes
//
// Sources, in priority order:
// 1. Environment variables with the BEACON_ prefix (highest)
// 2. Config file passed on the command line
// 3. Default config file locations (./beacon.toml, ./.beacon.toml)
// 4. Built-in defaults (lowest)

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

mod sources;
mod validation;

/// Top-level configuration shared by the gateway, worker and query service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeaconConfig {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub alerting: AlertingConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub kind: BusKind,
    /// Partition count for the in-memory bus.
    pub partitions: usize,
    /// Kafka bootstrap servers, comma-separated.
    pub brokers: String,
    pub topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Memory,
            partitions: 8,
            brokers: "localhost:9092".to_string(),
            topic: "beacon-metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Memory,
    Kafka,
}

impl std::str::FromStr for BusKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(BusKind::Memory),
            "kafka" => Ok(BusKind::Kafka),
            _ => anyhow::bail!("unsupported bus kind: {}. Supported: memory, kafka", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Bounded concurrency for store reads/writes.
    pub pool_size: usize,
    pub pool_acquire_timeout_ms: u64,
    pub parquet_row_group_size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            pool_size: 10,
            pool_acquire_timeout_ms: 5_000,
            parquet_row_group_size: 32 * 1024,
            fs: Some(FsConfig::default()),
            s3: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            "s3" => Ok(StorageBackend::S3),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            _ => anyhow::bail!("unsupported storage backend: {}. Supported: fs, s3, memory", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub max_batch_size: usize,
    /// Token bucket refill per identity, tokens per minute.
    pub rate_limit_rpm: f64,
    pub rate_limit_capacity: f64,
    pub preagg_enabled: bool,
    pub preagg_window_s: u64,
    pub preagg_max_keys: usize,
    pub publish_retry_budget: u32,
    pub request_deadline_s: u64,
    pub auth_enabled: bool,
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Node bits mixed into row ids; distinct per gateway replica.
    pub node_id: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            max_batch_size: 1_000,
            rate_limit_rpm: 1_000.0,
            rate_limit_capacity: 1_000.0,
            preagg_enabled: true,
            preagg_window_s: 60,
            preagg_max_keys: 10_000,
            publish_retry_budget: 3,
            request_deadline_s: 30,
            auth_enabled: false,
            api_keys: Vec::new(),
            node_id: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub consumer_group: String,
    pub target_batch_size: usize,
    pub batch_min: usize,
    pub batch_max: usize,
    pub max_flush_interval_ms: u64,
    pub breaker_fail_threshold: u32,
    pub breaker_cooldown_s: u64,
    /// Total insert attempts per flush: the first try plus in-place retries.
    pub insert_retry_attempts: u32,
    pub insert_retry_base_ms: u64,
    pub rollup_interval_s: u64,
    pub shutdown_deadline_s: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "beacon-worker".to_string(),
            target_batch_size: 100,
            batch_min: 10,
            batch_max: 5_000,
            max_flush_interval_ms: 1_000,
            breaker_fail_threshold: 5,
            breaker_cooldown_s: 60,
            insert_retry_attempts: 4,
            insert_retry_base_ms: 2_000,
            rollup_interval_s: 3_600,
            shutdown_deadline_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub listen_addr: String,
    pub default_range_s: u64,
    pub live_poll_ms: u64,
    pub live_buffer: usize,
    pub request_deadline_s: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8081".to_string(),
            default_range_s: 3_600,
            live_poll_ms: 1_000,
            live_buffer: 256,
            request_deadline_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub window_s: u64,
    pub err_ref: f64,
    pub lat_ref_lo_ms: f64,
    pub lat_ref_hi_ms: f64,
    pub traffic_ref: f64,
    pub error_weight: f64,
    pub latency_weight: f64,
    pub traffic_weight: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_s: 300,
            err_ref: 0.05,
            lat_ref_lo_ms: 100.0,
            lat_ref_hi_ms: 1_000.0,
            traffic_ref: 10_000.0,
            error_weight: 0.5,
            latency_weight: 0.3,
            traffic_weight: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    pub baseline_window_s: u64,
    pub eval_period_s: u64,
    pub sigma_k: f64,
    /// Below this sigma the bounds fall back to +/-20% of the mean.
    pub sigma_floor: f64,
    pub consec_breaches: u32,
    pub consec_ok: u32,
    pub refire_dedup_s: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            baseline_window_s: 7 * 24 * 3_600,
            eval_period_s: 60,
            sigma_k: 3.0,
            sigma_floor: 1e-6,
            consec_breaches: 2,
            consec_ok: 3,
            refire_dedup_s: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub raw_days: u32,
    pub hourly_days: u32,
    pub daily_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_days: 90,
            hourly_days: 365,
            daily_days: 3 * 365,
        }
    }
}

impl BeaconConfig {
    /// Load from an explicit file path, then apply env overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: BeaconConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        sources::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations, falling back to built-in defaults.
    pub fn load_or_default() -> Result<Self> {
        let mut config = sources::load_default_files()?.unwrap_or_default();
        sources::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        BeaconConfig::default().validate().unwrap();
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("fs".parse::<StorageBackend>().unwrap(), StorageBackend::Fs);
        assert_eq!("memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert!("blob".parse::<StorageBackend>().is_err());
        assert_eq!("kafka".parse::<BusKind>().unwrap(), BusKind::Kafka);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: BeaconConfig = toml::from_str(
            r#"
            [gateway]
            listen_addr = "127.0.0.1:9999"
            max_batch_size = 10
            rate_limit_rpm = 5.0
            rate_limit_capacity = 5.0
            preagg_enabled = false
            preagg_window_s = 60
            preagg_max_keys = 100
            publish_retry_budget = 3
            request_deadline_s = 30
            auth_enabled = false
            node_id = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.max_batch_size, 10);
        assert_eq!(config.worker.target_batch_size, 100);
        assert_eq!(config.retention.raw_days, 90);
    }
}
