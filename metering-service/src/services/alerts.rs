//! Alert evaluator: threshold-crossing detection with per-bucket dedup.

use dashmap::DashMap;

use crate::models::{
    AlertEvent, AlertLevel, MetricType, QuotaCheckResult, QuotaPolicy, TenantId,
};
use crate::services::metrics;

struct BucketAlertState {
    bucket_key: String,
    level: AlertLevel,
}

/// Per-(tenant, metric, bucket) state machine: `None -> Warning -> Critical`,
/// forward-only. A new event is emitted only when crossing into a strictly
/// higher severity than the last one recorded for the bucket; a dip back
/// below a threshold emits nothing. State resets at bucket rollover because
/// the stored bucket key no longer matches.
#[derive(Default)]
pub struct AlertEvaluator {
    states: DashMap<(TenantId, MetricType), BucketAlertState>,
}

impl AlertEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        policy: &QuotaPolicy,
        result: &QuotaCheckResult,
    ) -> Option<AlertEvent> {
        if policy.is_unlimited() || policy.limit == 0 || result.degraded {
            return None;
        }

        let ratio = result.current_usage as f64 / policy.limit as f64;
        let level = if ratio >= policy.critical_ratio {
            AlertLevel::Critical
        } else if ratio >= policy.warning_ratio {
            AlertLevel::Warning
        } else {
            AlertLevel::None
        };

        let bucket_key = result.bucket.key();
        let mut state = self
            .states
            .entry((tenant.clone(), metric))
            .or_insert_with(|| BucketAlertState {
                bucket_key: bucket_key.clone(),
                level: AlertLevel::None,
            });

        // Rollover: a new bucket starts clean.
        if state.bucket_key != bucket_key {
            state.bucket_key = bucket_key;
            state.level = AlertLevel::None;
        }

        if level <= state.level {
            return None;
        }
        state.level = level;

        let percentage = ratio * 100.0;
        metrics::record_alert(tenant.as_str(), metric.as_str(), level.as_str());
        Some(AlertEvent {
            tenant_id: tenant.clone(),
            metric,
            level,
            percentage,
            bucket_start: result.bucket.start,
            message: format!(
                "{} usage is at {:.1}% of quota ({}/{})",
                metric, percentage, result.current_usage, policy.limit
            ),
        })
    }
}
