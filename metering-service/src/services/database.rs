//! Postgres-backed ledger and policy store for metering-service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::error::AppError;
use crate::models::{
    Granularity, MetricType, PeriodBucket, PlanTier, PolicyScope, QuotaPolicy, TenantId,
    UsageEvent, UsageRecord,
};
use crate::services::ledger::{PolicyStore, UsageLedger};
use crate::services::metrics::DB_QUERY_DURATION;

/// Database connection pool wrapper. Implements both the durable usage
/// ledger and the policy store.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct UsageRecordRow {
    tenant_id: String,
    metric: String,
    bucket_start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
    granularity: String,
    total_value: i64,
    event_count: i64,
    last_updated: DateTime<Utc>,
}

impl UsageRecordRow {
    /// Rows with an unknown metric are corrupt: skipped, never fatal for the
    /// whole query.
    fn into_record(self) -> Result<UsageRecord, AppError> {
        let metric = MetricType::from_string(&self.metric).ok_or_else(|| {
            AppError::CorruptRecord(format!(
                "unknown metric '{}' for tenant {}",
                self.metric, self.tenant_id
            ))
        })?;
        Ok(UsageRecord {
            tenant_id: TenantId::new(self.tenant_id),
            metric,
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
            granularity: Granularity::from_string(&self.granularity),
            total_value: self.total_value,
            event_count: self.event_count,
            last_updated: self.last_updated,
        })
    }
}

#[derive(Debug, FromRow)]
struct QuotaPolicyRow {
    scope_kind: String,
    scope_id: String,
    metric: String,
    granularity: String,
    limit_value: i64,
    warning_ratio: f64,
    critical_ratio: f64,
}

impl QuotaPolicyRow {
    fn into_policy(self) -> Result<QuotaPolicy, AppError> {
        let scope = match self.scope_kind.as_str() {
            "tenant" => PolicyScope::Tenant(TenantId::new(self.scope_id)),
            "plan" => PolicyScope::Plan(PlanTier::from_string(&self.scope_id)),
            "system" => PolicyScope::SystemDefault,
            other => {
                return Err(AppError::CorruptRecord(format!(
                    "unknown policy scope kind '{other}'"
                )))
            }
        };
        let metric = MetricType::from_string(&self.metric).ok_or_else(|| {
            AppError::CorruptRecord(format!("unknown metric '{}' in policy", self.metric))
        })?;
        Ok(QuotaPolicy {
            scope,
            metric,
            granularity: Granularity::from_string(&self.granularity),
            limit: self.limit_value,
            warning_ratio: self.warning_ratio,
            critical_ratio: self.critical_ratio,
        })
    }
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::Ledger(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Ledger(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl UsageLedger for Database {
    /// Idempotent additive upsert: safe under concurrent flushers because
    /// the merge is pure summation.
    #[instrument(skip(self, bucket), fields(tenant_id = %tenant, metric = %metric))]
    async fn merge_usage(
        &self,
        tenant: &TenantId,
        metric: MetricType,
        bucket: &PeriodBucket,
        delta_total: i64,
        delta_events: i64,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["merge_usage"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO usage_records (tenant_id, metric, bucket_start, bucket_end, granularity, total_value, event_count, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (tenant_id, metric, bucket_start, granularity)
            DO UPDATE SET
                total_value = usage_records.total_value + EXCLUDED.total_value,
                event_count = usage_records.event_count + EXCLUDED.event_count,
                last_updated = now()
            "#,
        )
        .bind(tenant.as_str())
        .bind(metric.as_str())
        .bind(bucket.start)
        .bind(bucket.end)
        .bind(bucket.granularity.as_str())
        .bind(delta_total)
        .bind(delta_events)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Ledger(anyhow::anyhow!("Failed to merge usage: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant))]
    async fn fetch_records(
        &self,
        tenant: &TenantId,
        metric: Option<MetricType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fetch_records"])
            .start_timer();

        let rows: Vec<UsageRecordRow> = if let Some(metric) = metric {
            sqlx::query_as::<_, UsageRecordRow>(
                r#"
                SELECT tenant_id, metric, bucket_start, bucket_end, granularity, total_value, event_count, last_updated
                FROM usage_records
                WHERE tenant_id = $1 AND metric = $2 AND bucket_start < $3 AND bucket_end > $4
                ORDER BY bucket_start
                "#,
            )
            .bind(tenant.as_str())
            .bind(metric.as_str())
            .bind(end)
            .bind(start)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, UsageRecordRow>(
                r#"
                SELECT tenant_id, metric, bucket_start, bucket_end, granularity, total_value, event_count, last_updated
                FROM usage_records
                WHERE tenant_id = $1 AND bucket_start < $2 AND bucket_end > $3
                ORDER BY bucket_start
                "#,
            )
            .bind(tenant.as_str())
            .bind(end)
            .bind(start)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::Ledger(anyhow::anyhow!("Failed to fetch usage records: {}", e)))?;

        timer.observe_duration();

        // Corrupt rows are skipped and logged; one bad row must not block a
        // tenant's reporting.
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_record() {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping corrupt usage record"),
            }
        }
        Ok(records)
    }

    #[instrument(skip(self, event), fields(tenant_id = %event.tenant_id, metric = %event.metric))]
    async fn insert_event(&self, event: &UsageEvent) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_event"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO usage_events (event_id, tenant_id, metric, value, timestamp, resource_id, actor_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(event.tenant_id.as_str())
        .bind(event.metric.as_str())
        .bind(event.value)
        .bind(event.timestamp)
        .bind(&event.resource_id)
        .bind(&event.actor_id)
        .bind(&event.metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Ledger(anyhow::anyhow!("Failed to insert usage event: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Ledger(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for Database {
    #[instrument(skip(self), fields(scope = %scope, metric = %metric))]
    async fn get_policy(
        &self,
        scope: &PolicyScope,
        metric: MetricType,
        granularity: Granularity,
    ) -> Result<Option<QuotaPolicy>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_policy"])
            .start_timer();

        let row = sqlx::query_as::<_, QuotaPolicyRow>(
            r#"
            SELECT scope_kind, scope_id, metric, granularity, limit_value, warning_ratio, critical_ratio
            FROM quota_policies
            WHERE scope_kind = $1 AND scope_id = $2 AND metric = $3 AND granularity = $4
            "#,
        )
        .bind(scope.kind())
        .bind(scope.id())
        .bind(metric.as_str())
        .bind(granularity.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Ledger(anyhow::anyhow!("Failed to get policy: {}", e)))?;

        timer.observe_duration();

        match row {
            Some(row) => Ok(Some(row.into_policy()?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(scope = %scope, metric = %metric))]
    async fn list_policies(
        &self,
        scope: &PolicyScope,
        metric: MetricType,
    ) -> Result<Vec<QuotaPolicy>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_policies"])
            .start_timer();

        let rows = sqlx::query_as::<_, QuotaPolicyRow>(
            r#"
            SELECT scope_kind, scope_id, metric, granularity, limit_value, warning_ratio, critical_ratio
            FROM quota_policies
            WHERE scope_kind = $1 AND scope_id = $2 AND metric = $3
            "#,
        )
        .bind(scope.kind())
        .bind(scope.id())
        .bind(metric.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Ledger(anyhow::anyhow!("Failed to list policies: {}", e)))?;

        timer.observe_duration();

        let mut policies = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_policy() {
                Ok(policy) => policies.push(policy),
                Err(e) => warn!(error = %e, "Skipping corrupt policy row"),
            }
        }
        Ok(policies)
    }

    #[instrument(skip(self, policy), fields(scope = %policy.scope, metric = %policy.metric))]
    async fn upsert_policy(&self, policy: &QuotaPolicy) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_policy"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO quota_policies (scope_kind, scope_id, metric, granularity, limit_value, warning_ratio, critical_ratio, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (scope_kind, scope_id, metric, granularity)
            DO UPDATE SET
                limit_value = EXCLUDED.limit_value,
                warning_ratio = EXCLUDED.warning_ratio,
                critical_ratio = EXCLUDED.critical_ratio,
                updated_utc = now()
            "#,
        )
        .bind(policy.scope.kind())
        .bind(policy.scope.id())
        .bind(policy.metric.as_str())
        .bind(policy.granularity.as_str())
        .bind(policy.limit)
        .bind(policy.warning_ratio)
        .bind(policy.critical_ratio)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Ledger(anyhow::anyhow!("Failed to upsert policy: {}", e)))?;

        timer.observe_duration();
        info!(scope = %policy.scope, metric = %policy.metric, limit = policy.limit, "Policy upserted");
        Ok(())
    }
}
