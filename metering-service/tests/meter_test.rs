//! Integration tests for the usage meter facade: tracking helpers and
//! ledger-backed reporting.

mod common;

use metering_service::models::{Granularity, MetricType, PeriodBucket, UNLIMITED};
use metering_service::services::hot_store::usage_key;
use metering_service::services::CounterStore;

use common::{ledger_total, tenant, test_now, TestEngine};

#[tokio::test]
async fn summary_reflects_the_ledger_only_after_a_flush() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::ApiCalls, Granularity::Daily, 100)
        .await;

    engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, 25)
        .await
        .unwrap();

    // Before reconciliation the durable view lags the live counter.
    let before = engine.meter.usage_summary(&acme).await.unwrap();
    let api = before
        .metrics
        .iter()
        .find(|m| m.metric == MetricType::ApiCalls)
        .unwrap();
    assert_eq!(api.used, 0);

    engine.scheduler.flush_once().await.unwrap();

    let after = engine.meter.usage_summary(&acme).await.unwrap();
    let api = after
        .metrics
        .iter()
        .find(|m| m.metric == MetricType::ApiCalls)
        .unwrap();
    assert_eq!(api.used, 25);
    assert_eq!(api.limit, 100);
    assert!((api.percentage.unwrap() - 25.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn summary_covers_every_metric_and_hides_percentages_for_unlimited() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::StorageBytes, Granularity::Daily, UNLIMITED)
        .await;

    let summary = engine.meter.usage_summary(&acme).await.unwrap();
    assert_eq!(summary.metrics.len(), MetricType::ALL.len());
    assert_eq!(summary.tenant_id, acme);

    let storage = summary
        .metrics
        .iter()
        .find(|m| m.metric == MetricType::StorageBytes)
        .unwrap();
    assert_eq!(storage.limit, UNLIMITED);
    assert!(storage.percentage.is_none());

    // Metrics without a stored policy fall back to system defaults, which
    // are never unlimited.
    let flows = summary
        .metrics
        .iter()
        .find(|m| m.metric == MetricType::FlowExecutions)
        .unwrap();
    assert!(flows.limit > 0);
    assert!(flows.percentage.is_some());
}

#[tokio::test]
async fn track_flow_execution_meters_count_and_compute_time() {
    let engine = TestEngine::new();
    let acme = tenant("acme");

    engine
        .meter
        .track_flow_execution(&acme, "flow-7", 1250, Some("user-1"))
        .await
        .unwrap();
    engine
        .meter
        .track_flow_execution(&acme, "flow-7", 750, Some("user-1"))
        .await
        .unwrap();

    let bucket = PeriodBucket::containing(test_now(), Granularity::Daily);
    let flows_key = usage_key(&acme, MetricType::FlowExecutions, &bucket.key());
    let compute_key = usage_key(&acme, MetricType::ComputeMillis, &bucket.key());
    assert_eq!(engine.store.peek(&flows_key).await.unwrap(), 2);
    assert_eq!(engine.store.peek(&compute_key).await.unwrap(), 2000);

    engine.scheduler.flush_once().await.unwrap();
    assert_eq!(
        ledger_total(engine.ledger.as_ref(), &acme, MetricType::FlowExecutions).await,
        2
    );
    assert_eq!(
        ledger_total(engine.ledger.as_ref(), &acme, MetricType::ComputeMillis).await,
        2000
    );
}

#[tokio::test]
async fn track_api_call_increments_by_one() {
    let engine = TestEngine::new();
    let acme = tenant("acme");

    for _ in 0..3 {
        engine
            .meter
            .track_api_call(&acme, "/api/v1/flows", None)
            .await
            .unwrap();
    }

    let bucket = PeriodBucket::containing(test_now(), Granularity::Daily);
    let key = usage_key(&acme, MetricType::ApiCalls, &bucket.key());
    assert_eq!(engine.store.peek(&key).await.unwrap(), 3);
}

#[tokio::test]
async fn summary_ignores_usage_from_other_buckets() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::ApiCalls, Granularity::Daily, 100)
        .await;

    // Yesterday's usage does not count against today's window.
    engine
        .seed_record(
            &acme,
            MetricType::ApiCalls,
            test_now() - chrono::Duration::days(1),
            Granularity::Daily,
            90,
            90,
        )
        .await;
    engine
        .seed_record(&acme, MetricType::ApiCalls, test_now(), Granularity::Daily, 10, 10)
        .await;

    let summary = engine.meter.usage_summary(&acme).await.unwrap();
    let api = summary
        .metrics
        .iter()
        .find(|m| m.metric == MetricType::ApiCalls)
        .unwrap();
    assert_eq!(api.used, 10);
}
