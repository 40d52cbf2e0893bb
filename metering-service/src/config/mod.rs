//! Configuration module for metering-service.

use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::AppError;
use crate::services::gate::FallbackMode;

/// Common section loadable from `configuration.{toml,yaml}` or `APP__*`
/// environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct CommonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl CommonConfig {
    pub fn load() -> Result<Self, AppError> {
        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub common: CommonConfig,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Flush cadence for the sync scheduler.
    pub sync_interval: Duration,
    /// TTL for cached policy resolutions.
    pub policy_cache_ttl: Duration,
    /// Hard bound on hot-store calls made by the gate.
    pub hot_store_timeout: Duration,
    /// Posture when the hot store is unreachable.
    pub fallback: FallbackMode,
    /// Capacity of the bounded usage-event channel.
    pub event_buffer: usize,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let common = CommonConfig::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "metering-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_u64("DATABASE_MAX_CONNECTIONS", 10) as u32,
                min_connections: env_u64("DATABASE_MIN_CONNECTIONS", 2) as u32,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            },
            engine: EngineConfig {
                sync_interval: Duration::from_secs(env_u64("SYNC_INTERVAL_SECS", 60)),
                policy_cache_ttl: Duration::from_secs(env_u64("POLICY_CACHE_TTL_SECS", 300)),
                hot_store_timeout: Duration::from_millis(env_u64("HOT_STORE_TIMEOUT_MS", 100)),
                fallback: FallbackMode::from_string(
                    &env::var("QUOTA_FALLBACK").unwrap_or_else(|_| "fail_open".to_string()),
                ),
                event_buffer: env_u64("EVENT_BUFFER_SIZE", 1024) as usize,
            },
        })
    }
}
