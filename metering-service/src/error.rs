//! Error types for the metering engine.

use std::time::Duration;
use thiserror::Error;

use crate::models::Granularity;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Transient store error: {0}")]
    TransientStore(anyhow::Error),

    #[error("Hot store timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Ledger error: {0}")]
    Ledger(anyhow::Error),

    #[error("No policy found for scope {0}")]
    PolicyNotFound(String),

    #[error("Unsupported granularity: records stored at {stored} cannot answer a {requested} query")]
    UnsupportedGranularity {
        stored: Granularity,
        requested: Granularity,
    },

    #[error("Corrupt record skipped: {0}")]
    CorruptRecord(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl AppError {
    /// Stable label for the `errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::TransientStore(_) => "transient_store",
            AppError::StoreTimeout(_) => "store_timeout",
            AppError::Ledger(_) => "ledger",
            AppError::PolicyNotFound(_) => "policy_not_found",
            AppError::UnsupportedGranularity { .. } => "unsupported_granularity",
            AppError::CorruptRecord(_) => "corrupt_record",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::ConfigError(_) => "config",
            AppError::RedisError(_) => "redis",
            AppError::DatabaseError(_) => "database",
            AppError::InternalError(_) => "internal",
        }
    }
}
