//! Usage events, durable aggregates, and gate results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{Granularity, MetricType, PeriodBucket};

/// Opaque tenant identifier, the isolation boundary for all usage data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One metered occurrence. Immutable, write-once, best-effort retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub metric: MetricType,
    pub value: i64,
    pub timestamp: DateTime<Utc>,
    pub resource_id: Option<String>,
    pub actor_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl UsageEvent {
    pub fn new(tenant_id: TenantId, metric: MetricType, value: i64, at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tenant_id,
            metric,
            value,
            timestamp: at,
            resource_id: None,
            actor_id: None,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// Durable aggregate for a (tenant, metric, bucket). Updated by additive
/// merge only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: TenantId,
    pub metric: MetricType,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub granularity: Granularity,
    pub total_value: i64,
    pub event_count: i64,
    pub last_updated: DateTime<Utc>,
}

/// Outcome of a gate decision. Transient, not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaCheckResult {
    pub allowed: bool,
    pub current_usage: i64,
    /// `-1` means unlimited.
    pub limit: i64,
    /// Remaining units in the bucket; `-1` when unlimited.
    pub remaining: i64,
    /// The enforcement window; `bucket.end` is when the quota resets.
    pub bucket: PeriodBucket,
    /// True when the decision was made under the configured fallback because
    /// the hot store was unreachable.
    pub degraded: bool,
}

/// Per-metric line in a usage summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricUsage {
    pub metric: MetricType,
    pub used: i64,
    pub limit: i64,
    /// `None` when the policy is unlimited.
    pub percentage: Option<f64>,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
}

/// Current-period usage across all metrics for one tenant.
///
/// Read from the durable ledger only, so values lag live counters by at most
/// one sync interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub tenant_id: TenantId,
    pub generated_at: DateTime<Utc>,
    pub metrics: Vec<MetricUsage>,
}

/// One reporting bucket from the window aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowPoint {
    pub bucket_start: DateTime<Utc>,
    pub total: i64,
    pub count: i64,
    pub avg: f64,
    pub min: i64,
    pub max: i64,
}
