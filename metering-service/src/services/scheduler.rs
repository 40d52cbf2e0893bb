//! Sync/reconciliation scheduler: drains hot-store deltas into the durable
//! ledger on a fixed timer.
//!
//! Each usage counter carries a flush watermark in the same shared store
//! (`flushed:` / `flushed_events:` companion counters). A flush merges only
//! the *unflushed remainder* (live total minus watermark) and advances the
//! watermark by the amount it merged, only after the durable write succeeded.
//! Because the watermark lives next to the counter it tracks, a restarted
//! scheduler or an additional flusher instance sees the same remainder and
//! never re-merges already-flushed usage; increments racing a flush are
//! picked up by the next tick instead of lost.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::AppError;
use crate::services::hot_store::{
    events_key_for, flushed_events_key_for, flushed_key_for, parse_usage_key, CounterStore,
    USAGE_PREFIX,
};
use crate::services::ledger::UsageLedger;
use crate::services::metrics;

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Keys with a non-zero remainder that were merged durably.
    pub flushed: usize,
    /// Keys whose durable write failed; their watermarks were not advanced.
    pub failed: usize,
}

pub struct FlushScheduler {
    store: Arc<dyn CounterStore>,
    ledger: Arc<dyn UsageLedger>,
    interval: Duration,
}

impl FlushScheduler {
    pub fn new(
        store: Arc<dyn CounterStore>,
        ledger: Arc<dyn UsageLedger>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            interval,
        }
    }

    /// One flush pass over every live usage key. Per-key failures are
    /// isolated: a failed merge never blocks other tenants' keys.
    #[instrument(skip(self))]
    pub async fn flush_once(&self) -> Result<FlushOutcome, AppError> {
        let keys = self.store.scan(USAGE_PREFIX).await?;
        let mut outcome = FlushOutcome::default();

        for key in &keys {
            match self.flush_key(key).await {
                Ok(true) => {
                    outcome.flushed += 1;
                    metrics::record_flush_key("flushed");
                }
                Ok(false) => {}
                Err(e) => {
                    outcome.failed += 1;
                    metrics::record_flush_key("failed");
                    metrics::record_error(e.kind(), "flush");
                    warn!(key = %key, error = %e, "Flush failed for key, watermark not advanced");
                }
            }
        }

        debug!(flushed = outcome.flushed, failed = outcome.failed, "Flush pass complete");
        Ok(outcome)
    }

    async fn flush_key(&self, key: &str) -> Result<bool, AppError> {
        let Some((tenant, metric, bucket)) = parse_usage_key(key) else {
            return Err(AppError::CorruptRecord(format!(
                "unparseable hot-store key '{key}'"
            )));
        };
        // Derivable from any valid usage key; checked above via the parse.
        let Some(flushed_key) = flushed_key_for(key) else {
            return Err(AppError::CorruptRecord(format!(
                "no watermark key for '{key}'"
            )));
        };

        // Best-effort snapshot; concurrent increments after this read are
        // covered by the next tick because only the read value is flushed.
        let live = self.store.peek(key).await?;
        let live_events = match events_key_for(key) {
            Some(events_key) => self.store.peek(&events_key).await?,
            None => 0,
        };
        let flushed = self.store.peek(&flushed_key).await?;
        let flushed_events = match flushed_events_key_for(key) {
            Some(k) => self.store.peek(&k).await?,
            None => 0,
        };

        let remainder = (live - flushed).max(0);
        let event_remainder = (live_events - flushed_events).max(0);

        if remainder == 0 && event_remainder == 0 {
            return Ok(false);
        }

        self.ledger
            .merge_usage(&tenant, metric, &bucket, remainder, event_remainder)
            .await?;

        // Advance only after the durable write succeeded. The watermark
        // shares the counter's TTL so both expire together at rollover.
        let ttl = bucket.granularity.counter_ttl();
        if remainder > 0 {
            self.store.increment(&flushed_key, remainder, ttl).await?;
        }
        if event_remainder > 0 {
            if let Some(k) = flushed_events_key_for(key) {
                self.store.increment(&k, event_remainder, ttl).await?;
            }
        }

        Ok(true)
    }

    /// Run the flush loop until the task is aborted. Failed passes back off
    /// exponentially instead of hammering a struggling ledger.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Flush scheduler started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut retry = ExponentialBackoff {
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            };

            loop {
                ticker.tick().await;
                match self.flush_once().await {
                    Ok(outcome) if outcome.failed == 0 => {
                        retry.reset();
                    }
                    Ok(outcome) => {
                        warn!(failed = outcome.failed, "Flush pass had failures, backing off");
                        if let Some(delay) = retry.next_backoff() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Flush pass failed, backing off");
                        metrics::record_error(e.kind(), "flush_pass");
                        if let Some(delay) = retry.next_backoff() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        })
    }
}
