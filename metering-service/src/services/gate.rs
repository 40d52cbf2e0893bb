//! Quota enforcement gate: the check-and-reserve decision on the hot path.
//!
//! Protocol: increment the hot counter first, read the resulting total, and
//! issue a compensating decrement if the limit was crossed. No lock is held;
//! worst-case overshoot is bounded by the number of requests in flight when
//! the limit is crossed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::error::AppError;
use crate::models::{
    MetricType, PeriodBucket, QuotaCheckResult, QuotaPolicy, TenantId, UsageEvent, UNLIMITED,
};
use crate::services::clock::Clock;
use crate::services::hot_store::{events_key_for, usage_key, CounterStore};
use crate::services::metrics::{self, HOT_STORE_DURATION};
use crate::services::registry::PolicyRegistry;

/// Posture when the hot store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    /// Admit and log as degraded.
    FailOpen,
    /// Reject.
    FailClosed,
}

impl FallbackMode {
    pub fn from_string(s: &str) -> Self {
        match s {
            "fail_closed" => FallbackMode::FailClosed,
            _ => FallbackMode::FailOpen,
        }
    }
}

pub struct QuotaGate {
    store: Arc<dyn CounterStore>,
    registry: Arc<PolicyRegistry>,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<UsageEvent>,
    fallback: FallbackMode,
    store_timeout: Duration,
}

impl QuotaGate {
    pub fn new(
        store: Arc<dyn CounterStore>,
        registry: Arc<PolicyRegistry>,
        clock: Arc<dyn Clock>,
        events: mpsc::Sender<UsageEvent>,
        fallback: FallbackMode,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            events,
            fallback,
            store_timeout,
        }
    }

    /// Check-and-reserve `amount` units for (tenant, metric) in the current
    /// period bucket.
    #[instrument(skip(self), fields(tenant_id = %tenant, metric = %metric))]
    pub async fn check_and_reserve(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        amount: i64,
    ) -> Result<QuotaCheckResult, AppError> {
        if amount < 0 {
            return Err(AppError::InvalidInput(format!(
                "requested amount must be non-negative, got {amount}"
            )));
        }

        let policy = self.registry.resolve_enforced(tenant, metric).await;
        let bucket = PeriodBucket::containing(self.clock.now(), policy.granularity);
        let key = usage_key(tenant, metric, &bucket.key());
        let ttl = bucket.granularity.counter_ttl();

        if policy.is_unlimited() {
            // Still counted, for statistics and reporting.
            let current = match self.incr(&key, amount, ttl).await {
                Ok(total) => total,
                Err(e) => {
                    self.log_degraded(tenant, metric, &e);
                    0
                }
            };
            self.note_admitted(tenant, metric, amount, &key, ttl).await;
            metrics::record_quota_check(tenant.as_str(), metric.as_str(), "allowed");
            return Ok(QuotaCheckResult {
                allowed: true,
                current_usage: current,
                limit: UNLIMITED,
                remaining: UNLIMITED,
                bucket,
                degraded: false,
            });
        }

        // Increment first, verify after.
        let new_total = match self.incr(&key, amount, ttl).await {
            Ok(total) => total,
            Err(e) => {
                self.log_degraded(tenant, metric, &e);
                metrics::record_quota_check(tenant.as_str(), metric.as_str(), "degraded");
                return Ok(self.degraded_result(&policy, bucket));
            }
        };

        if new_total <= policy.limit {
            self.note_admitted(tenant, metric, amount, &key, ttl).await;
            metrics::record_quota_check(tenant.as_str(), metric.as_str(), "allowed");
            return Ok(QuotaCheckResult {
                allowed: true,
                current_usage: new_total,
                limit: policy.limit,
                remaining: policy.limit - new_total,
                bucket,
                degraded: false,
            });
        }

        // Over the limit: compensating decrement, then reject.
        if let Err(e) = self.incr(&key, -amount, ttl).await {
            // The rollback itself failed; the overshoot stands until the
            // bucket expires. Surfaced via metrics for reconciliation.
            warn!(tenant_id = %tenant, metric = %metric, error = %e,
                "Compensating decrement failed after quota rejection");
            metrics::record_error(e.kind(), "rollback");
        }

        let prior = new_total - amount;
        metrics::record_quota_check(tenant.as_str(), metric.as_str(), "rejected");
        debug!(tenant_id = %tenant, metric = %metric, prior_usage = prior,
            limit = policy.limit, "Quota exceeded");

        Ok(QuotaCheckResult {
            allowed: false,
            current_usage: prior,
            limit: policy.limit,
            remaining: (policy.limit - prior).max(0),
            bucket,
            degraded: false,
        })
    }

    /// Fire-and-forget tracking for metrics that are recorded after the fact
    /// rather than gated (e.g. storage bytes). Returns the new bucket total.
    #[instrument(skip(self, event_fields), fields(tenant_id = %tenant, metric = %metric))]
    pub async fn record_usage(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        amount: i64,
        event_fields: EventFields,
    ) -> Result<i64, AppError> {
        if amount < 0 {
            return Err(AppError::InvalidInput(format!(
                "usage amount must be non-negative, got {amount}"
            )));
        }

        let policy = self.registry.resolve_enforced(tenant, metric).await;
        let bucket = PeriodBucket::containing(self.clock.now(), policy.granularity);
        let key = usage_key(tenant, metric, &bucket.key());
        let ttl = bucket.granularity.counter_ttl();

        let new_total = self.incr(&key, amount, ttl).await?;
        self.bump_event_counter(&key, ttl).await;

        let mut event = UsageEvent::new(tenant.clone(), metric, amount, self.clock.now());
        if let Some(metadata) = event_fields.metadata {
            event = event.with_metadata(metadata);
        }
        if let Some(resource_id) = event_fields.resource_id {
            event = event.with_resource(resource_id);
        }
        if let Some(actor_id) = event_fields.actor_id {
            event = event.with_actor(actor_id);
        }
        self.emit(event);

        Ok(new_total)
    }

    /// The policy the gate enforces right now; used by the facade to
    /// evaluate alert thresholds against the same limits.
    pub async fn effective_policy(&self, tenant: &TenantId, metric: MetricType) -> QuotaPolicy {
        self.registry.resolve_enforced(tenant, metric).await
    }

    async fn note_admitted(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        amount: i64,
        key: &str,
        ttl: Duration,
    ) {
        self.bump_event_counter(key, ttl).await;
        self.emit(UsageEvent::new(
            tenant.clone(),
            metric,
            amount,
            self.clock.now(),
        ));
    }

    async fn bump_event_counter(&self, key: &str, ttl: Duration) {
        if let Some(events_key) = events_key_for(key) {
            if let Err(e) = self.incr(&events_key, 1, ttl).await {
                debug!(error = %e, "Event counter increment failed");
            }
        }
    }

    /// Best-effort event emission; a full channel drops the event and must
    /// never fail the admission decision.
    fn emit(&self, event: UsageEvent) {
        if self.events.try_send(event).is_err() {
            metrics::record_event_dropped();
        }
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, AppError> {
        let timer = HOT_STORE_DURATION
            .with_label_values(&["increment"])
            .start_timer();
        let result =
            tokio::time::timeout(self.store_timeout, self.store.increment(key, delta, ttl))
                .await
                .map_err(|_| AppError::StoreTimeout(self.store_timeout))?;
        timer.observe_duration();
        result
    }

    fn log_degraded(&self, tenant: &TenantId, metric: MetricType, error: &AppError) {
        warn!(tenant_id = %tenant, metric = %metric, error = %error,
            fallback = ?self.fallback, "Hot store unavailable, applying fallback");
        metrics::record_error(error.kind(), "check_and_reserve");
    }

    fn degraded_result(&self, policy: &QuotaPolicy, bucket: PeriodBucket) -> QuotaCheckResult {
        match self.fallback {
            FallbackMode::FailOpen => QuotaCheckResult {
                allowed: true,
                current_usage: 0,
                limit: policy.limit,
                remaining: policy.limit,
                bucket,
                degraded: true,
            },
            FallbackMode::FailClosed => QuotaCheckResult {
                allowed: false,
                current_usage: 0,
                limit: policy.limit,
                remaining: 0,
                bucket,
                degraded: true,
            },
        }
    }
}

/// Optional context attached to emitted usage events.
#[derive(Debug, Clone, Default)]
pub struct EventFields {
    pub resource_id: Option<String>,
    pub actor_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}
