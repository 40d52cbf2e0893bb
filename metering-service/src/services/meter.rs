//! Usage meter facade: the engine surface consumed by request handlers and
//! the reporting/administration layer.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{instrument, warn};

use crate::error::AppError;
use crate::models::{
    AlertEvent, AlertLevel, Granularity, MetricType, MetricUsage, PeriodBucket, QuotaCheckResult,
    SetQuotaPolicy, TenantId, UsageSummary, WindowPoint,
};
use crate::services::aggregator::WindowAggregator;
use crate::services::alerts::AlertEvaluator;
use crate::services::clock::Clock;
use crate::services::gate::{EventFields, QuotaGate};
use crate::services::ledger::UsageLedger;
use crate::services::registry::PolicyRegistry;

pub struct UsageMeter {
    gate: QuotaGate,
    registry: Arc<PolicyRegistry>,
    aggregator: WindowAggregator,
    alerts: AlertEvaluator,
    ledger: Arc<dyn UsageLedger>,
    clock: Arc<dyn Clock>,
    alert_tx: broadcast::Sender<AlertEvent>,
}

impl UsageMeter {
    pub fn new(
        gate: QuotaGate,
        registry: Arc<PolicyRegistry>,
        ledger: Arc<dyn UsageLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (alert_tx, _) = broadcast::channel(64);
        Self {
            gate,
            registry,
            aggregator: WindowAggregator::new(ledger.clone()),
            alerts: AlertEvaluator::new(),
            ledger,
            clock,
            alert_tx,
        }
    }

    /// Subscribe to deduplicated threshold alerts emitted by the gate path.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_tx.subscribe()
    }

    /// Synchronous admission gate, called before performing the metered
    /// operation.
    pub async fn check_and_reserve(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        amount: i64,
    ) -> Result<QuotaCheckResult, AppError> {
        let result = self.gate.check_and_reserve(tenant, metric, amount).await?;

        let policy = self.gate.effective_policy(tenant, metric).await;
        if let Some(event) = self.alerts.evaluate(tenant, metric, &policy, &result) {
            warn!(tenant_id = %tenant, metric = %metric, level = event.level.as_str(),
                percentage = event.percentage, "Quota threshold crossed");
            // No receivers is fine; alerts are also logged and counted.
            let _ = self.alert_tx.send(event);
        }

        Ok(result)
    }

    /// Fire-and-forget tracking for metrics recorded after the fact.
    pub async fn record_usage(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        amount: i64,
        fields: EventFields,
    ) -> Result<i64, AppError> {
        self.gate.record_usage(tenant, metric, amount, fields).await
    }

    /// Track one API call against the tenant's quota statistics.
    pub async fn track_api_call(
        &self,
        tenant: &TenantId,
        endpoint: &str,
        actor_id: Option<&str>,
    ) -> Result<i64, AppError> {
        self.record_usage(
            tenant,
            MetricType::ApiCalls,
            1,
            EventFields {
                resource_id: Some(endpoint.to_string()),
                actor_id: actor_id.map(str::to_string),
                metadata: None,
            },
        )
        .await
    }

    /// Track one flow execution: the execution count and its compute time.
    pub async fn track_flow_execution(
        &self,
        tenant: &TenantId,
        flow_id: &str,
        execution_time_ms: i64,
        actor_id: Option<&str>,
    ) -> Result<(), AppError> {
        let fields = EventFields {
            resource_id: Some(flow_id.to_string()),
            actor_id: actor_id.map(str::to_string),
            metadata: Some(json!({ "execution_time_ms": execution_time_ms })),
        };
        self.record_usage(tenant, MetricType::FlowExecutions, 1, fields.clone())
            .await?;
        self.record_usage(
            tenant,
            MetricType::ComputeMillis,
            execution_time_ms.max(0),
            fields,
        )
        .await?;
        Ok(())
    }

    /// Track a storage write.
    pub async fn track_storage(
        &self,
        tenant: &TenantId,
        bytes: i64,
        file_id: Option<&str>,
    ) -> Result<i64, AppError> {
        self.record_usage(
            tenant,
            MetricType::StorageBytes,
            bytes,
            EventFields {
                resource_id: file_id.map(str::to_string),
                ..EventFields::default()
            },
        )
        .await
    }

    /// Current-period usage for every metric in the catalog, with limits and
    /// percentages. Reads the durable ledger only, so values lag live
    /// counters by at most one sync interval.
    #[instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn usage_summary(&self, tenant: &TenantId) -> Result<UsageSummary, AppError> {
        let now = self.clock.now();
        let mut entries = Vec::with_capacity(MetricType::ALL.len());

        for metric in MetricType::ALL {
            let policy = self.gate.effective_policy(tenant, metric).await;
            let bucket = PeriodBucket::containing(now, policy.granularity);
            let used = self
                .ledger
                .fetch_records(tenant, Some(metric), bucket.start, bucket.end)
                .await?
                .iter()
                .filter(|r| r.granularity == policy.granularity)
                .map(|r| r.total_value)
                .sum::<i64>();

            let percentage = if policy.is_unlimited() || policy.limit == 0 {
                None
            } else {
                Some(used as f64 / policy.limit as f64 * 100.0)
            };

            entries.push(MetricUsage {
                metric,
                used,
                limit: policy.limit,
                percentage,
                bucket_start: bucket.start,
                bucket_end: bucket.end,
            });
        }

        Ok(UsageSummary {
            tenant_id: tenant.clone(),
            generated_at: now,
            metrics: entries,
        })
    }

    /// Time series for a tenant/metric over `[start, end)` at the requested
    /// granularity.
    pub async fn trends(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<WindowPoint>, AppError> {
        self.aggregator
            .query(tenant, Some(metric), start, end, granularity)
            .await
    }

    /// Metrics currently at or above `threshold_ratio` of their limit,
    /// derived from the ledger-backed summary. Unlimited metrics never
    /// alert.
    pub async fn alerts(
        &self,
        tenant: &TenantId,
        threshold_ratio: f64,
    ) -> Result<Vec<AlertEvent>, AppError> {
        let summary = self.usage_summary(tenant).await?;
        let mut out = Vec::new();

        for entry in &summary.metrics {
            let Some(percentage) = entry.percentage else {
                continue;
            };
            if percentage < threshold_ratio * 100.0 {
                continue;
            }
            let policy = self.gate.effective_policy(tenant, entry.metric).await;
            let level = if percentage >= policy.critical_ratio * 100.0 {
                AlertLevel::Critical
            } else {
                AlertLevel::Warning
            };
            out.push(AlertEvent {
                tenant_id: tenant.clone(),
                metric: entry.metric,
                level,
                percentage,
                bucket_start: entry.bucket_start,
                message: format!(
                    "{} usage is at {:.1}% of quota ({}/{})",
                    entry.metric, percentage, entry.used, entry.limit
                ),
            });
        }

        Ok(out)
    }

    /// Create or update a quota policy; the change is visible on the next
    /// resolve thanks to eager cache invalidation. New limits apply
    /// prospectively only: usage already admitted under an older, higher
    /// limit stands.
    pub async fn set_policy(&self, input: SetQuotaPolicy) -> Result<(), AppError> {
        self.registry.set_policy(input).await?;
        Ok(())
    }
}
