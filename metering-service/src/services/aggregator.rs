//! Window aggregator: time-bucketed reporting over the durable ledger.
//!
//! Reads the ledger only, never the hot store, so results lag live counters
//! by at most one sync interval. That trade-off keeps enforcement latency
//! independent of reporting load.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use crate::error::AppError;
use crate::models::{Granularity, MetricType, PeriodBucket, TenantId, WindowPoint};
use crate::services::ledger::UsageLedger;

struct BucketAcc {
    total: i64,
    count: i64,
    min: i64,
    max: i64,
    samples: u32,
}

pub struct WindowAggregator {
    ledger: Arc<dyn UsageLedger>,
}

impl WindowAggregator {
    pub fn new(ledger: Arc<dyn UsageLedger>) -> Self {
        Self { ledger }
    }

    /// Bucketed totals for `[start, end)` at the requested granularity.
    ///
    /// Finer stored records roll up into coarser requested buckets (daily
    /// into monthly); the reverse is impossible, so a request finer than any
    /// stored record returns [`AppError::UnsupportedGranularity`] rather
    /// than a guess. `min`/`max`/`avg` describe the contributing stored
    /// records in each requested bucket.
    #[instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn query(
        &self,
        tenant: &TenantId,
        metric: Option<MetricType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<WindowPoint>, AppError> {
        let records = self.ledger.fetch_records(tenant, metric, start, end).await?;

        let mut buckets: BTreeMap<DateTime<Utc>, BucketAcc> = BTreeMap::new();
        for record in records {
            if record.granularity.rank() > granularity.rank() {
                return Err(AppError::UnsupportedGranularity {
                    stored: record.granularity,
                    requested: granularity,
                });
            }
            let bucket_start = PeriodBucket::containing(record.bucket_start, granularity).start;
            let acc = buckets.entry(bucket_start).or_insert(BucketAcc {
                total: 0,
                count: 0,
                min: i64::MAX,
                max: i64::MIN,
                samples: 0,
            });
            acc.total += record.total_value;
            acc.count += record.event_count;
            acc.min = acc.min.min(record.total_value);
            acc.max = acc.max.max(record.total_value);
            acc.samples += 1;
        }

        Ok(buckets
            .into_iter()
            .map(|(bucket_start, acc)| WindowPoint {
                bucket_start,
                total: acc.total,
                count: acc.count,
                avg: acc.total as f64 / acc.samples as f64,
                min: acc.min,
                max: acc.max,
            })
            .collect())
    }
}
