//! Durable usage ledger and policy store traits, with in-memory
//! implementations for tests and single-node use.
//!
//! The ledger is the source of truth for historical aggregates. Merges are
//! pure summation, so they stay correct under concurrent flushers and
//! repeated application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::AppError;
use crate::models::{
    Granularity, MetricType, PeriodBucket, PolicyScope, QuotaPolicy, TenantId, UsageEvent,
    UsageRecord,
};

/// Durable, queryable usage history.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Additively merge a flushed delta into the (tenant, metric, bucket)
    /// record, creating it lazily. Never replace-on-write.
    async fn merge_usage(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        bucket: &PeriodBucket,
        delta_total: i64,
        delta_events: i64,
    ) -> Result<(), AppError>;

    /// Records overlapping `[start, end)` for a tenant, optionally filtered
    /// by metric. Ordered by bucket start.
    async fn fetch_records(
        &self,
        tenant: &TenantId,
        metric: Option<MetricType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, AppError>;

    /// Append one usage event. Best-effort retention; callers never couple
    /// admission decisions to this.
    async fn insert_event(&self, event: &UsageEvent) -> Result<(), AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

/// Backing store for quota policies.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(
        &self,
        scope: &PolicyScope,
        metric: MetricType,
        granularity: Granularity,
    ) -> Result<Option<QuotaPolicy>, AppError>;

    /// All policies a scope defines for a metric, across granularities.
    async fn list_policies(
        &self,
        scope: &PolicyScope,
        metric: MetricType,
    ) -> Result<Vec<QuotaPolicy>, AppError>;

    async fn upsert_policy(&self, policy: &QuotaPolicy) -> Result<(), AppError>;
}

type RecordKey = (TenantId, MetricType, DateTime<Utc>, Granularity);

/// In-process ledger used by the integration tests.
#[derive(Default)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<RecordKey, UsageRecord>>,
    events: Mutex<Vec<UsageEvent>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained events (test observability).
    pub fn event_count(&self) -> usize {
        self.events.lock().expect("ledger mutex poisoned").len()
    }
}

#[async_trait]
impl UsageLedger for InMemoryLedger {
    async fn merge_usage(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        bucket: &PeriodBucket,
        delta_total: i64,
        delta_events: i64,
    ) -> Result<(), AppError> {
        let mut records = self.records.lock().expect("ledger mutex poisoned");
        let key = (tenant.clone(), metric, bucket.start, bucket.granularity);
        let now = Utc::now();
        let record = records.entry(key).or_insert_with(|| UsageRecord {
            tenant_id: tenant.clone(),
            metric,
            bucket_start: bucket.start,
            bucket_end: bucket.end,
            granularity: bucket.granularity,
            total_value: 0,
            event_count: 0,
            last_updated: now,
        });
        record.total_value += delta_total;
        record.event_count += delta_events;
        record.last_updated = now;
        Ok(())
    }

    async fn fetch_records(
        &self,
        tenant: &TenantId,
        metric: Option<MetricType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, AppError> {
        let records = self.records.lock().expect("ledger mutex poisoned");
        let mut out: Vec<UsageRecord> = records
            .values()
            .filter(|r| {
                r.tenant_id == *tenant
                    && metric.map(|m| r.metric == m).unwrap_or(true)
                    && r.bucket_start < end
                    && r.bucket_end > start
            })
            .cloned()
            .collect();
        out.sort_by_key(|r| r.bucket_start);
        Ok(out)
    }

    async fn insert_event(&self, event: &UsageEvent) -> Result<(), AppError> {
        self.events
            .lock()
            .expect("ledger mutex poisoned")
            .push(event.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

type PolicyKey = (String, MetricType, Granularity);

/// In-process policy store used by the integration tests.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: Mutex<HashMap<PolicyKey, QuotaPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_policy(
        &self,
        scope: &PolicyScope,
        metric: MetricType,
        granularity: Granularity,
    ) -> Result<Option<QuotaPolicy>, AppError> {
        let policies = self.policies.lock().expect("policy mutex poisoned");
        Ok(policies
            .get(&(scope.to_string(), metric, granularity))
            .cloned())
    }

    async fn list_policies(
        &self,
        scope: &PolicyScope,
        metric: MetricType,
    ) -> Result<Vec<QuotaPolicy>, AppError> {
        let policies = self.policies.lock().expect("policy mutex poisoned");
        let scope_key = scope.to_string();
        Ok(policies
            .iter()
            .filter(|((s, m, _), _)| *s == scope_key && *m == metric)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn upsert_policy(&self, policy: &QuotaPolicy) -> Result<(), AppError> {
        let mut policies = self.policies.lock().expect("policy mutex poisoned");
        policies.insert(
            (policy.scope.to_string(), policy.metric, policy.granularity),
            policy.clone(),
        );
        Ok(())
    }
}
