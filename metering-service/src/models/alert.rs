//! Threshold alert model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MetricType, TenantId};

/// Alert severity. Ordering matters: transitions within a bucket are
/// forward-only (`None -> Warning -> Critical`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    None,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::None => "none",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

/// Emitted when usage crosses into a strictly higher severity for a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub tenant_id: TenantId,
    pub metric: MetricType,
    pub level: AlertLevel,
    /// Usage as a percentage of the limit (0-100+).
    pub percentage: f64,
    pub bucket_start: DateTime<Utc>,
    pub message: String,
}
