//! Hot counter store: the atomic, low-latency tier consulted on the
//! request-serving path. Never blocks on the durable ledger.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::models::{MetricType, PeriodBucket, TenantId};

/// Prefix for live usage counters.
pub const USAGE_PREFIX: &str = "usage:";
/// Prefix for companion per-bucket event counters.
pub const EVENTS_PREFIX: &str = "events:";
/// Prefix for flush watermarks: how much of a usage counter has already been
/// merged into the durable ledger. Lives in the shared store so schedulers
/// survive restarts and multiple flusher instances agree on the remainder.
pub const FLUSHED_PREFIX: &str = "flushed:";
/// Prefix for the event-count flush watermark paired with [`FLUSHED_PREFIX`].
pub const FLUSHED_EVENTS_PREFIX: &str = "flushed_events:";

/// Key for the live usage counter of a (tenant, metric, bucket).
pub fn usage_key(tenant: &TenantId, metric: MetricType, bucket_key: &str) -> String {
    format!("{USAGE_PREFIX}{tenant}:{metric}:{bucket_key}")
}

/// Key for the event counter paired with a usage counter.
pub fn events_key_for(usage_key: &str) -> Option<String> {
    usage_key
        .strip_prefix(USAGE_PREFIX)
        .map(|rest| format!("{EVENTS_PREFIX}{rest}"))
}

/// Key for the flush watermark paired with a usage counter.
pub fn flushed_key_for(usage_key: &str) -> Option<String> {
    usage_key
        .strip_prefix(USAGE_PREFIX)
        .map(|rest| format!("{FLUSHED_PREFIX}{rest}"))
}

/// Key for the event-count flush watermark paired with a usage counter.
pub fn flushed_events_key_for(usage_key: &str) -> Option<String> {
    usage_key
        .strip_prefix(USAGE_PREFIX)
        .map(|rest| format!("{FLUSHED_EVENTS_PREFIX}{rest}"))
}

/// Split a scanned usage key back into (tenant, metric, bucket).
///
/// The metric and bucket segments never contain `:`, so splitting from the
/// right keeps tenant ids with embedded separators intact.
pub fn parse_usage_key(key: &str) -> Option<(TenantId, MetricType, PeriodBucket)> {
    let rest = key.strip_prefix(USAGE_PREFIX)?;
    let mut parts = rest.rsplitn(3, ':');
    let bucket_key = parts.next()?;
    let metric = MetricType::from_string(parts.next()?)?;
    let tenant = parts.next()?;
    let bucket = PeriodBucket::parse_key(bucket_key)?;
    Some((TenantId::new(tenant), metric, bucket))
}

/// Atomic counter store shared by all gate instances. Increments to the same
/// key are linearizable; the atomicity is provided by the store itself, not
/// client-side locking.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` (may be negative for compensating decrements)
    /// and return the new total. `ttl` applies on first touch of the key.
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, AppError>;

    /// Current total for a key; 0 when absent or expired.
    async fn peek(&self, key: &str) -> Result<i64, AppError>;

    /// Live keys under a prefix. Best-effort snapshot for the flush
    /// scheduler; may interleave with concurrent increments.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

/// Redis-backed counter store.
#[derive(Clone)]
pub struct RedisCounterStore {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn new(url: &str) -> Result<Self, AppError> {
        tracing::info!(url = %url, "Connecting to Redis");
        let client = Client::open(url.to_string())?;

        // ConnectionManager reconnects automatically
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            AppError::TransientStore(anyhow::anyhow!("Failed to connect to Redis: {}", e))
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, AppError> {
        let mut conn = self.manager.clone();
        let new_total: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;

        // First touch created the key: attach the TTL so stale buckets
        // self-expire rather than accumulate forever.
        if new_total == delta {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs())
                .query_async::<_, ()>(&mut conn)
                .await?;
        }

        Ok(new_total)
    }

    async fn peek(&self, key: &str) -> Result<i64, AppError> {
        let mut conn = self.manager.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.unwrap_or(0))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::TransientStore(anyhow::anyhow!("Redis ping failed: {}", e)))
    }
}

struct CounterEntry {
    value: i64,
    expires_at: Instant,
}

/// In-process counter store backed by a concurrent map. Used by tests and
/// single-node deployments; entry-level locking gives the same per-key
/// linearizability as Redis.
#[derive(Default)]
pub struct InMemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, AppError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                value: 0,
                expires_at: now + ttl,
            });
        if entry.expires_at <= now {
            entry.value = 0;
            entry.expires_at = now + ttl;
        }
        entry.value += delta;
        Ok(entry.value)
    }

    async fn peek(&self, key: &str) -> Result<i64, AppError> {
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value)
            .unwrap_or(0))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let now = Instant::now();
        // Scan doubles as eviction so expired buckets do not accumulate.
        self.entries.retain(|_, e| e.expires_at > now);
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
