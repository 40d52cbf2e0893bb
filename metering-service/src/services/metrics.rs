//! Metrics module for metering-service.
//! Provides Prometheus metrics for quota decisions, flush cycles, and
//! storage-tier latency.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Encoder, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Ledger query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Hot store operation duration histogram
pub static HOT_STORE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_hot_store_duration_seconds",
            "Hot counter store operation duration",
            vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]
        ),
        &["operation"]
    )
    .expect("Failed to register HOT_STORE_DURATION")
});

/// Quota check counter (per-tenant metering)
pub static QUOTA_CHECKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Flush cycle key counter
pub static FLUSH_KEYS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Alerts emitted counter
pub static ALERTS_EMITTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage events dropped (channel full or write failed)
pub static EVENTS_DROPPED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    QUOTA_CHECKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_quota_checks_total",
                "Quota gate decisions by tenant, metric, and outcome"
            ),
            &["tenant_id", "metric", "outcome"]
        )
        .expect("Failed to register QUOTA_CHECKS_TOTAL")
    });

    FLUSH_KEYS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_flush_keys_total",
                "Hot-store keys processed per flush cycle by result"
            ),
            &["result"]
        )
        .expect("Failed to register FLUSH_KEYS_TOTAL")
    });

    ALERTS_EMITTED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_alerts_emitted_total",
                "Threshold alerts emitted by tenant, metric, and level"
            ),
            &["tenant_id", "metric", "level"]
        )
        .expect("Failed to register ALERTS_EMITTED_TOTAL")
    });

    EVENTS_DROPPED_TOTAL.get_or_init(|| {
        register_int_counter!(opts!(
            "metering_events_dropped_total",
            "Usage events dropped because the channel was full or the write failed"
        ))
        .expect("Failed to register EVENTS_DROPPED_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
    let _ = &*HOT_STORE_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a gate decision.
pub fn record_quota_check(tenant_id: &str, metric: &str, outcome: &str) {
    if let Some(counter) = QUOTA_CHECKS_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, metric, outcome])
            .inc();
    }
}

/// Record a flushed or failed key in a flush cycle.
pub fn record_flush_key(result: &str) {
    if let Some(counter) = FLUSH_KEYS_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

/// Record an emitted alert.
pub fn record_alert(tenant_id: &str, metric: &str, level: &str) {
    if let Some(counter) = ALERTS_EMITTED_TOTAL.get() {
        counter.with_label_values(&[tenant_id, metric, level]).inc();
    }
}

/// Record a dropped usage event.
pub fn record_event_dropped() {
    if let Some(counter) = EVENTS_DROPPED_TOTAL.get() {
        counter.inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
