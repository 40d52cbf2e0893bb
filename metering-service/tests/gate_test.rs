//! Integration tests for the quota enforcement gate.

mod common;

use std::sync::Arc;
use std::time::Duration;

use metering_service::error::AppError;
use metering_service::models::{Granularity, MetricType, PeriodBucket, UNLIMITED};
use metering_service::services::hot_store::usage_key;
use metering_service::services::{CounterStore, FallbackMode};

use common::{tenant, test_now, FailingCounterStore, TestEngine};

#[tokio::test]
async fn admits_up_to_the_exact_limit_then_rejects() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::ApiCalls, Granularity::Daily, 1000)
        .await;

    for _ in 0..999 {
        let result = engine
            .meter
            .check_and_reserve(&acme, MetricType::ApiCalls, 1)
            .await
            .unwrap();
        assert!(result.allowed);
    }

    // The request that lands exactly on the limit is still admitted.
    let at_limit = engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, 1)
        .await
        .unwrap();
    assert!(at_limit.allowed);
    assert_eq!(at_limit.current_usage, 1000);
    assert_eq!(at_limit.remaining, 0);

    // The next one is rejected and the counter is rolled back.
    let over = engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, 1)
        .await
        .unwrap();
    assert!(!over.allowed);
    assert_eq!(over.current_usage, 1000);
    assert_eq!(over.remaining, 0);
    assert_eq!(over.limit, 1000);
}

#[tokio::test]
async fn rejection_rolls_back_so_smaller_requests_still_fit() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::FlowExecutions, Granularity::Daily, 10)
        .await;

    let first = engine
        .meter
        .check_and_reserve(&acme, MetricType::FlowExecutions, 8)
        .await
        .unwrap();
    assert!(first.allowed);
    assert_eq!(first.remaining, 2);

    // 8 + 5 would overshoot; the reservation must be undone.
    let too_big = engine
        .meter
        .check_and_reserve(&acme, MetricType::FlowExecutions, 5)
        .await
        .unwrap();
    assert!(!too_big.allowed);
    assert_eq!(too_big.current_usage, 8);
    assert_eq!(too_big.remaining, 2);

    let fits = engine
        .meter
        .check_and_reserve(&acme, MetricType::FlowExecutions, 2)
        .await
        .unwrap();
    assert!(fits.allowed);
    assert_eq!(fits.current_usage, 10);
    assert_eq!(fits.remaining, 0);
}

#[tokio::test]
async fn unlimited_policy_always_admits_but_still_counts() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::ApiCalls, Granularity::Daily, UNLIMITED)
        .await;

    for _ in 0..3 {
        let result = engine
            .meter
            .check_and_reserve(&acme, MetricType::ApiCalls, 100)
            .await
            .unwrap();
        assert!(result.allowed);
        assert_eq!(result.limit, UNLIMITED);
        assert_eq!(result.remaining, UNLIMITED);
    }

    // Usage is still tracked in the hot store for reporting.
    let bucket = PeriodBucket::containing(test_now(), Granularity::Daily);
    let key = usage_key(&acme, MetricType::ApiCalls, &bucket.key());
    assert_eq!(engine.store.peek(&key).await.unwrap(), 300);
}

#[tokio::test]
async fn zero_limit_rejects_everything() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::TeamMembers, Granularity::Monthly, 0)
        .await;

    let result = engine
        .meter
        .check_and_reserve(&acme, MetricType::TeamMembers, 1)
        .await
        .unwrap();
    assert!(!result.allowed);
    assert_eq!(result.current_usage, 0);
    assert_eq!(result.remaining, 0);
}

#[tokio::test]
async fn negative_amount_is_rejected_as_invalid_input() {
    let engine = TestEngine::new();
    let acme = tenant("acme");

    let err = engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, -5)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn quota_resets_at_bucket_rollover() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::ApiCalls, Granularity::Daily, 2)
        .await;

    for _ in 0..2 {
        assert!(engine
            .meter
            .check_and_reserve(&acme, MetricType::ApiCalls, 1)
            .await
            .unwrap()
            .allowed);
    }
    assert!(!engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, 1)
        .await
        .unwrap()
        .allowed);

    // Next day, new bucket, fresh counter.
    engine.clock.advance(chrono::Duration::days(1));
    let fresh = engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, 1)
        .await
        .unwrap();
    assert!(fresh.allowed);
    assert_eq!(fresh.current_usage, 1);
}

#[tokio::test]
async fn tenants_do_not_share_counters() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    let globex = tenant("globex");
    for t in [&acme, &globex] {
        engine
            .set_tenant_limit(t, MetricType::ApiCalls, Granularity::Daily, 1)
            .await;
    }

    assert!(engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, 1)
        .await
        .unwrap()
        .allowed);
    assert!(!engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, 1)
        .await
        .unwrap()
        .allowed);

    // Exhausting acme must not affect globex.
    assert!(engine
        .meter
        .check_and_reserve(&globex, MetricType::ApiCalls, 1)
        .await
        .unwrap()
        .allowed);
}

#[tokio::test]
async fn fail_open_admits_as_degraded_when_hot_store_is_down() {
    let engine = TestEngine::with_gate_store(Arc::new(FailingCounterStore), FallbackMode::FailOpen);
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::ApiCalls, Granularity::Daily, 10)
        .await;

    let result = engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, 1)
        .await
        .unwrap();
    assert!(result.allowed);
    assert!(result.degraded);
    assert_eq!(result.limit, 10);
}

#[tokio::test]
async fn fail_closed_rejects_as_degraded_when_hot_store_is_down() {
    let engine =
        TestEngine::with_gate_store(Arc::new(FailingCounterStore), FallbackMode::FailClosed);
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::ApiCalls, Granularity::Daily, 10)
        .await;

    let result = engine
        .meter
        .check_and_reserve(&acme, MetricType::ApiCalls, 1)
        .await
        .unwrap();
    assert!(!result.allowed);
    assert!(result.degraded);
    assert_eq!(result.remaining, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_the_limit() {
    let engine = Arc::new(TestEngine::new());
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::ApiCalls, Granularity::Daily, 50)
        .await;

    let mut handles = Vec::new();
    for _ in 0..100 {
        let engine = engine.clone();
        let acme = acme.clone();
        handles.push(tokio::spawn(async move {
            engine
                .meter
                .check_and_reserve(&acme, MetricType::ApiCalls, 1)
                .await
                .unwrap()
                .allowed
        }));
    }

    let mut admitted = 0i64;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert!(admitted <= 50, "admitted {admitted} past a limit of 50");

    // Every rejection was compensated, so the counter equals the admissions.
    let bucket = PeriodBucket::containing(test_now(), Granularity::Daily);
    let key = usage_key(&acme, MetricType::ApiCalls, &bucket.key());
    assert_eq!(engine.store.peek(&key).await.unwrap(), admitted);
}

#[tokio::test]
async fn admitted_usage_emits_events_to_the_ledger() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::ApiCalls, Granularity::Daily, 100)
        .await;

    for _ in 0..5 {
        engine
            .meter
            .check_and_reserve(&acme, MetricType::ApiCalls, 1)
            .await
            .unwrap();
    }

    // The event writer drains its channel asynchronously.
    for _ in 0..50 {
        if engine.ledger.event_count() >= 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.ledger.event_count(), 5);
}

#[tokio::test]
async fn record_usage_bypasses_the_limit() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .set_tenant_limit(&acme, MetricType::StorageBytes, Granularity::Daily, 100)
        .await;

    // Tracking is not gating: a recorded value may exceed the limit.
    let total = engine
        .meter
        .track_storage(&acme, 500, Some("file-1"))
        .await
        .unwrap();
    assert_eq!(total, 500);

    let bucket = PeriodBucket::containing(test_now(), Granularity::Daily);
    let key = usage_key(&acme, MetricType::StorageBytes, &bucket.key());
    assert_eq!(engine.store.peek(&key).await.unwrap(), 500);
}
