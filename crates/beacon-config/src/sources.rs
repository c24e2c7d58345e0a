// Configuration file discovery and environment overrides.

use std::env;
use std::path::Path;

use anyhow::{Context, Result};

use crate::{BeaconConfig, BusKind, FsConfig, LogFormat, S3Config, StorageBackend};

const DEFAULT_FILES: &[&str] = &["./beacon.toml", "./.beacon.toml"];

/// Try the default config file locations in order.
pub(crate) fn load_default_files() -> Result<Option<BeaconConfig>> {
    for candidate in DEFAULT_FILES {
        let path = Path::new(candidate);
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {candidate}"))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {candidate}"))?;
            return Ok(Some(config));
        }
    }
    Ok(None)
}

/// Apply `BEACON_*` environment overrides on top of whatever was loaded.
pub(crate) fn apply_env_overrides(config: &mut BeaconConfig) -> Result<()> {
    if let Ok(level) = env::var("BEACON_LOG_LEVEL") {
        config.log.level = level;
    }
    if let Ok(format) = env::var("BEACON_LOG_FORMAT") {
        config.log.format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" => LogFormat::Text,
            other => anyhow::bail!("BEACON_LOG_FORMAT must be text or json, got {other}"),
        };
    }

    if let Ok(kind) = env::var("BEACON_BUS_KIND") {
        config.bus.kind = kind.parse::<BusKind>()?;
    }
    if let Ok(brokers) = env::var("BEACON_BUS_BROKERS") {
        config.bus.brokers = brokers;
    }
    if let Ok(topic) = env::var("BEACON_BUS_TOPIC") {
        config.bus.topic = topic;
    }

    if let Ok(backend) = env::var("BEACON_STORAGE_BACKEND") {
        config.storage.backend = backend.parse::<StorageBackend>()?;
    }
    if let Ok(path) = env::var("BEACON_STORAGE_FS_PATH") {
        config
            .storage
            .fs
            .get_or_insert_with(FsConfig::default)
            .path = path;
    }
    if let Ok(bucket) = env::var("BEACON_STORAGE_S3_BUCKET") {
        let s3 = config.storage.s3.get_or_insert_with(|| S3Config {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
        });
        s3.bucket = bucket;
    }
    if let Ok(region) = env::var("BEACON_STORAGE_S3_REGION") {
        if let Some(s3) = config.storage.s3.as_mut() {
            s3.region = region;
        }
    }
    if let Ok(endpoint) = env::var("BEACON_STORAGE_S3_ENDPOINT") {
        if let Some(s3) = config.storage.s3.as_mut() {
            s3.endpoint = Some(endpoint);
        }
    }

    if let Ok(addr) = env::var("BEACON_GATEWAY_LISTEN") {
        config.gateway.listen_addr = addr;
    }
    if let Ok(addr) = env::var("BEACON_QUERY_LISTEN") {
        config.query.listen_addr = addr;
    }
    if let Ok(size) = env::var("BEACON_MAX_BATCH_SIZE") {
        config.gateway.max_batch_size = size
            .parse()
            .context("BEACON_MAX_BATCH_SIZE must be an integer")?;
    }
    if let Ok(rpm) = env::var("BEACON_RATE_LIMIT_RPM") {
        config.gateway.rate_limit_rpm = rpm
            .parse()
            .context("BEACON_RATE_LIMIT_RPM must be a number")?;
    }
    if let Ok(enabled) = env::var("BEACON_AUTH_ENABLED") {
        config.gateway.auth_enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
    }
    if let Ok(keys) = env::var("BEACON_API_KEYS") {
        config.gateway.api_keys = keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_owned)
            .collect();
    }

    Ok(())
}
