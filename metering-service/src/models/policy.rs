//! Quota policy model.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Granularity, MetricType, TenantId};

/// Sentinel limit meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// Subscription plan tiers, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Basic,
    Professional,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Basic => "basic",
            PlanTier::Professional => "professional",
            PlanTier::Enterprise => "enterprise",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "basic" => PlanTier::Basic,
            "professional" => PlanTier::Professional,
            "enterprise" => PlanTier::Enterprise,
            _ => PlanTier::Free,
        }
    }
}

/// Who a policy applies to. Most specific scope wins: tenant > plan > system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum PolicyScope {
    Tenant(TenantId),
    Plan(PlanTier),
    SystemDefault,
}

impl PolicyScope {
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyScope::Tenant(_) => "tenant",
            PolicyScope::Plan(_) => "plan",
            PolicyScope::SystemDefault => "system",
        }
    }

    /// Scope identifier as stored in the policy table.
    pub fn id(&self) -> String {
        match self {
            PolicyScope::Tenant(t) => t.to_string(),
            PolicyScope::Plan(p) => p.as_str().to_string(),
            PolicyScope::SystemDefault => "default".to_string(),
        }
    }
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Effective limit for (scope, metric, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub scope: PolicyScope,
    pub metric: MetricType,
    pub granularity: Granularity,
    /// `-1` means unlimited.
    pub limit: i64,
    pub warning_ratio: f64,
    pub critical_ratio: f64,
}

impl QuotaPolicy {
    pub fn is_unlimited(&self) -> bool {
        self.limit == UNLIMITED
    }

    /// Conservative built-in fallback; policy absence must never silently
    /// become "unlimited".
    pub fn system_default(metric: MetricType, granularity: Granularity) -> Self {
        let daily_limit: i64 = match metric {
            MetricType::ApiCalls => 10_000,
            MetricType::FlowExecutions => 1_000,
            MetricType::StorageBytes => 1 << 30, // 1 GiB
            MetricType::ComputeMillis => 3_600_000,
            MetricType::TeamMembers => 5,
        };
        let limit = match granularity {
            Granularity::Hourly => (daily_limit / 24).max(1),
            Granularity::Daily => daily_limit,
            Granularity::Monthly => daily_limit.saturating_mul(31),
        };
        Self {
            scope: PolicyScope::SystemDefault,
            metric,
            granularity,
            limit,
            warning_ratio: 0.80,
            critical_ratio: 0.95,
        }
    }
}

/// Input for creating or updating a policy.
#[derive(Debug, Clone)]
pub struct SetQuotaPolicy {
    pub scope: PolicyScope,
    pub metric: MetricType,
    pub granularity: Granularity,
    pub limit: i64,
    pub warning_ratio: Option<f64>,
    pub critical_ratio: Option<f64>,
}

impl SetQuotaPolicy {
    pub fn into_policy(self) -> QuotaPolicy {
        QuotaPolicy {
            scope: self.scope,
            metric: self.metric,
            granularity: self.granularity,
            limit: self.limit,
            warning_ratio: self.warning_ratio.unwrap_or(0.80),
            critical_ratio: self.critical_ratio.unwrap_or(0.95),
        }
    }
}
