//! Quota policy registry: scope resolution with a short-TTL cache.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::models::{
    Granularity, MetricType, PlanTier, PolicyScope, QuotaPolicy, SetQuotaPolicy, TenantId,
};
use crate::services::ledger::PolicyStore;

/// Supplies the plan tier a tenant is subscribed to. Backed by the billing
/// collaborator in production; static in tests and single-node setups.
#[async_trait]
pub trait PlanResolver: Send + Sync {
    async fn plan_for(&self, tenant: &TenantId) -> Result<PlanTier, AppError>;
}

/// Resolves every tenant to one fixed tier.
pub struct StaticPlanResolver {
    tier: PlanTier,
}

impl StaticPlanResolver {
    pub fn new(tier: PlanTier) -> Self {
        Self { tier }
    }
}

#[async_trait]
impl PlanResolver for StaticPlanResolver {
    async fn plan_for(&self, _tenant: &TenantId) -> Result<PlanTier, AppError> {
        Ok(self.tier)
    }
}

/// `None` granularity caches the gate's enforcement-period resolution.
type CacheKey = (TenantId, MetricType, Option<Granularity>);

struct CachedPolicy {
    policy: QuotaPolicy,
    fetched_at: Instant,
}

/// Period preference when the caller does not pin one: daily is the common
/// enforcement window, monthly the billing window, hourly the burst window.
const PERIOD_PREFERENCE: [Granularity; 3] =
    [Granularity::Daily, Granularity::Monthly, Granularity::Hourly];

/// Effective-limit resolution: tenant override, then plan-tier default, then
/// the built-in system default. Absence never becomes "unlimited".
pub struct PolicyRegistry {
    store: Arc<dyn PolicyStore>,
    plans: Arc<dyn PlanResolver>,
    cache: DashMap<CacheKey, CachedPolicy>,
    cache_ttl: Duration,
}

impl PolicyRegistry {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        plans: Arc<dyn PlanResolver>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            plans,
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Resolve the effective policy for (tenant, metric, period).
    pub async fn resolve(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        granularity: Granularity,
    ) -> QuotaPolicy {
        self.resolve_cached(tenant, metric, Some(granularity)).await
    }

    /// Resolve the policy the gate should enforce for (tenant, metric)
    /// without pinning a period: the most specific scope that defines any
    /// policy for the metric wins, and its own period drives the bucket.
    pub async fn resolve_enforced(&self, tenant: &TenantId, metric: MetricType) -> QuotaPolicy {
        self.resolve_cached(tenant, metric, None).await
    }

    async fn resolve_cached(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        granularity: Option<Granularity>,
    ) -> QuotaPolicy {
        let key = (tenant.clone(), metric, granularity);
        if let Some(cached) = self.cache.get(&key) {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return cached.policy.clone();
            }
        }

        let policy = self.resolve_uncached(tenant, metric, granularity).await;
        self.cache.insert(
            key,
            CachedPolicy {
                policy: policy.clone(),
                fetched_at: Instant::now(),
            },
        );
        policy
    }

    async fn resolve_uncached(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        granularity: Option<Granularity>,
    ) -> QuotaPolicy {
        let mut scopes = vec![PolicyScope::Tenant(tenant.clone())];
        match self.plans.plan_for(tenant).await {
            Ok(tier) => scopes.push(PolicyScope::Plan(tier)),
            Err(e) => {
                warn!(tenant_id = %tenant, error = %e, "Plan resolution failed, falling back");
            }
        }

        for scope in &scopes {
            match self.lookup_scope(scope, metric, granularity).await {
                Ok(Some(policy)) => return policy,
                Ok(None) => {}
                Err(e) => {
                    // Policy lookup failures never hard-fail the calling
                    // request.
                    warn!(tenant_id = %tenant, metric = %metric, scope = %scope, error = %e,
                        "Policy lookup failed, falling back");
                }
            }
        }

        debug!(tenant_id = %tenant, metric = %metric, "No stored policy, using system default");
        QuotaPolicy::system_default(metric, granularity.unwrap_or(Granularity::Daily))
    }

    async fn lookup_scope(
        &self,
        scope: &PolicyScope,
        metric: MetricType,
        granularity: Option<Granularity>,
    ) -> Result<Option<QuotaPolicy>, AppError> {
        match granularity {
            Some(granularity) => self.store.get_policy(scope, metric, granularity).await,
            None => {
                let policies = self.store.list_policies(scope, metric).await?;
                for preferred in PERIOD_PREFERENCE {
                    if let Some(policy) =
                        policies.iter().find(|p| p.granularity == preferred)
                    {
                        return Ok(Some(policy.clone()));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Write a policy through to the store and eagerly invalidate cached
    /// entries so the change is visible on the next resolve.
    pub async fn set_policy(&self, input: SetQuotaPolicy) -> Result<QuotaPolicy, AppError> {
        let policy = input.into_policy();
        self.store.upsert_policy(&policy).await?;

        match &policy.scope {
            PolicyScope::Tenant(tenant) => {
                self.cache
                    .remove(&(tenant.clone(), policy.metric, Some(policy.granularity)));
                self.cache.remove(&(tenant.clone(), policy.metric, None));
            }
            // Plan and system policies feed many tenants' cache entries;
            // drop everything for the affected metric.
            PolicyScope::Plan(_) | PolicyScope::SystemDefault => {
                self.cache
                    .retain(|(_, metric, _), _| *metric != policy.metric);
            }
        }

        Ok(policy)
    }
}
