//! Test helper module for metering-service integration tests.
//!
//! Builds the engine against the in-memory backends so tests need no
//! external Redis or PostgreSQL.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metering_service::error::AppError;
use metering_service::models::{
    Granularity, MetricType, PeriodBucket, PlanTier, PolicyScope, SetQuotaPolicy, TenantId,
    UsageEvent, UsageRecord,
};
use metering_service::services::{
    event_channel, CounterStore, EventWriter, FallbackMode, FlushScheduler, InMemoryCounterStore,
    InMemoryLedger, InMemoryPolicyStore, ManualClock, PolicyRegistry, QuotaGate,
    StaticPlanResolver, UsageLedger, UsageMeter,
};

/// Fixed "now" used by most tests: mid-day, mid-month, so hourly/daily/
/// monthly buckets are all unambiguous.
pub fn test_now() -> DateTime<Utc> {
    "2024-03-15T12:00:00Z".parse().expect("valid timestamp")
}

pub struct TestEngine {
    pub meter: UsageMeter,
    pub store: Arc<InMemoryCounterStore>,
    pub ledger: Arc<InMemoryLedger>,
    pub policies: Arc<InMemoryPolicyStore>,
    pub clock: Arc<ManualClock>,
    pub scheduler: FlushScheduler,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_fallback(FallbackMode::FailOpen)
    }

    pub fn with_fallback(fallback: FallbackMode) -> Self {
        let store = Arc::new(InMemoryCounterStore::new());
        Self::build(store.clone(), store, fallback)
    }

    /// Engine whose gate talks to `gate_store` while the scheduler drains
    /// the in-memory store (`self.store`); used to inject hot-store failures.
    pub fn with_gate_store(gate_store: Arc<dyn CounterStore>, fallback: FallbackMode) -> Self {
        Self::build(gate_store, Arc::new(InMemoryCounterStore::new()), fallback)
    }

    fn build(
        gate_store: Arc<dyn CounterStore>,
        flush_store: Arc<InMemoryCounterStore>,
        fallback: FallbackMode,
    ) -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let policies = Arc::new(InMemoryPolicyStore::new());
        let clock = Arc::new(ManualClock::new(test_now()));

        let registry = Arc::new(PolicyRegistry::new(
            policies.clone(),
            Arc::new(StaticPlanResolver::new(PlanTier::Free)),
            Duration::from_secs(300),
        ));

        let (event_tx, event_rx) = event_channel(1024);
        EventWriter::new(ledger.clone(), event_rx).spawn();

        let gate = QuotaGate::new(
            gate_store,
            registry.clone(),
            clock.clone(),
            event_tx,
            fallback,
            Duration::from_millis(200),
        );

        let ledger_dyn: Arc<dyn UsageLedger> = ledger.clone();
        let meter = UsageMeter::new(gate, registry, ledger_dyn.clone(), clock.clone());

        let scheduler = FlushScheduler::new(
            flush_store.clone(),
            ledger_dyn,
            Duration::from_secs(60),
        );

        Self {
            meter,
            store: flush_store,
            ledger,
            policies,
            clock,
            scheduler,
        }
    }

    /// Set a tenant-scoped limit through the facade (exercises the
    /// write-through + cache invalidation path).
    pub async fn set_tenant_limit(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        granularity: Granularity,
        limit: i64,
    ) {
        self.meter
            .set_policy(SetQuotaPolicy {
                scope: PolicyScope::Tenant(tenant.clone()),
                metric,
                granularity,
                limit,
                warning_ratio: None,
                critical_ratio: None,
            })
            .await
            .expect("set_policy failed");
    }

    /// Seed a ledger record directly, for reporting tests.
    pub async fn seed_record(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        at: DateTime<Utc>,
        granularity: Granularity,
        total: i64,
        events: i64,
    ) {
        let bucket = PeriodBucket::containing(at, granularity);
        self.ledger
            .merge_usage(tenant, metric, &bucket, total, events)
            .await
            .expect("seed failed");
    }
}

/// Counter store that always fails, for degraded-mode tests.
pub struct FailingCounterStore;

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn increment(&self, _key: &str, _delta: i64, _ttl: Duration) -> Result<i64, AppError> {
        Err(AppError::TransientStore(anyhow::anyhow!(
            "injected hot store failure"
        )))
    }

    async fn peek(&self, _key: &str) -> Result<i64, AppError> {
        Err(AppError::TransientStore(anyhow::anyhow!(
            "injected hot store failure"
        )))
    }

    async fn scan(&self, _prefix: &str) -> Result<Vec<String>, AppError> {
        Err(AppError::TransientStore(anyhow::anyhow!(
            "injected hot store failure"
        )))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Err(AppError::TransientStore(anyhow::anyhow!(
            "injected hot store failure"
        )))
    }
}

/// Ledger wrapper whose merges fail while the switch is on, for watermark
/// retry tests.
pub struct FlakyLedger {
    inner: InMemoryLedger,
    failing: AtomicBool,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self {
            inner: InMemoryLedger::new(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl UsageLedger for FlakyLedger {
    async fn merge_usage(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        bucket: &PeriodBucket,
        delta_total: i64,
        delta_events: i64,
    ) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Ledger(anyhow::anyhow!("injected ledger failure")));
        }
        self.inner
            .merge_usage(tenant, metric, bucket, delta_total, delta_events)
            .await
    }

    async fn fetch_records(
        &self,
        tenant: &TenantId,
        metric: Option<MetricType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, AppError> {
        self.inner.fetch_records(tenant, metric, start, end).await
    }

    async fn insert_event(&self, event: &UsageEvent) -> Result<(), AppError> {
        self.inner.insert_event(event).await
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id)
}

/// Total usage stored in the ledger for a tenant/metric across all buckets.
pub async fn ledger_total(
    ledger: &dyn UsageLedger,
    tenant: &TenantId,
    metric: MetricType,
) -> i64 {
    let start = "2000-01-01T00:00:00Z".parse().expect("valid timestamp");
    let end = "2100-01-01T00:00:00Z".parse().expect("valid timestamp");
    ledger
        .fetch_records(tenant, Some(metric), start, end)
        .await
        .expect("fetch failed")
        .iter()
        .map(|r| r.total_value)
        .sum()
}
