//! Domain models for the metering engine.

mod alert;
mod metric;
mod period;
mod policy;
mod usage;

pub use alert::{AlertEvent, AlertLevel};
pub use metric::{MetricType, UnitKind};
pub use period::{Granularity, PeriodBucket};
pub use policy::{PlanTier, PolicyScope, QuotaPolicy, SetQuotaPolicy, UNLIMITED};
pub use usage::{
    MetricUsage, QuotaCheckResult, TenantId, UsageEvent, UsageRecord, UsageSummary, WindowPoint,
};
