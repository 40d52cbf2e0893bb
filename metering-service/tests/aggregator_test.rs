//! Integration tests for window aggregation over the durable ledger.

mod common;

use chrono::{DateTime, Utc};

use metering_service::error::AppError;
use metering_service::models::{Granularity, MetricType};

use common::{tenant, TestEngine};

fn march(day: u32) -> DateTime<Utc> {
    format!("2024-03-{day:02}T00:00:00Z")
        .parse()
        .expect("valid timestamp")
}

fn utc(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid timestamp")
}

#[tokio::test]
async fn daily_records_roll_up_into_monthly_buckets() {
    let engine = TestEngine::new();
    let acme = tenant("acme");

    for day in 1..=30 {
        engine
            .seed_record(
                &acme,
                MetricType::ApiCalls,
                march(day),
                Granularity::Daily,
                100,
                10,
            )
            .await;
    }

    let points = engine
        .meter
        .trends(
            &acme,
            MetricType::ApiCalls,
            utc("2024-03-01T00:00:00Z"),
            utc("2024-04-01T00:00:00Z"),
            Granularity::Monthly,
        )
        .await
        .unwrap();

    assert_eq!(points.len(), 1);
    assert_eq!(points[0].bucket_start, utc("2024-03-01T00:00:00Z"));
    assert_eq!(points[0].total, 3000);
    assert_eq!(points[0].count, 300);
    assert_eq!(points[0].min, 100);
    assert_eq!(points[0].max, 100);
    assert!((points[0].avg - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn same_granularity_passes_through_with_stats() {
    let engine = TestEngine::new();
    let acme = tenant("acme");

    for (day, value) in [(1, 100), (2, 50), (3, 150)] {
        engine
            .seed_record(
                &acme,
                MetricType::FlowExecutions,
                march(day),
                Granularity::Daily,
                value,
                1,
            )
            .await;
    }

    let daily = engine
        .meter
        .trends(
            &acme,
            MetricType::FlowExecutions,
            utc("2024-03-01T00:00:00Z"),
            utc("2024-04-01T00:00:00Z"),
            Granularity::Daily,
        )
        .await
        .unwrap();
    assert_eq!(daily.len(), 3);
    assert_eq!(daily[0].total, 100);
    assert_eq!(daily[1].total, 50);
    assert_eq!(daily[2].total, 150);

    let monthly = engine
        .meter
        .trends(
            &acme,
            MetricType::FlowExecutions,
            utc("2024-03-01T00:00:00Z"),
            utc("2024-04-01T00:00:00Z"),
            Granularity::Monthly,
        )
        .await
        .unwrap();
    assert_eq!(monthly.len(), 1);
    assert_eq!(monthly[0].total, 300);
    assert_eq!(monthly[0].min, 50);
    assert_eq!(monthly[0].max, 150);
    assert!((monthly[0].avg - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn requesting_finer_than_stored_is_an_error() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .seed_record(
            &acme,
            MetricType::ApiCalls,
            march(1),
            Granularity::Daily,
            100,
            1,
        )
        .await;

    let err = engine
        .meter
        .trends(
            &acme,
            MetricType::ApiCalls,
            utc("2024-03-01T00:00:00Z"),
            utc("2024-03-02T00:00:00Z"),
            Granularity::Hourly,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::UnsupportedGranularity {
            stored: Granularity::Daily,
            requested: Granularity::Hourly,
        }
    ));
}

#[tokio::test]
async fn records_outside_the_window_are_excluded() {
    let engine = TestEngine::new();
    let acme = tenant("acme");
    engine
        .seed_record(
            &acme,
            MetricType::ApiCalls,
            utc("2024-02-15T00:00:00Z"),
            Granularity::Daily,
            999,
            1,
        )
        .await;
    engine
        .seed_record(
            &acme,
            MetricType::ApiCalls,
            march(10),
            Granularity::Daily,
            42,
            1,
        )
        .await;

    let points = engine
        .meter
        .trends(
            &acme,
            MetricType::ApiCalls,
            utc("2024-03-01T00:00:00Z"),
            utc("2024-04-01T00:00:00Z"),
            Granularity::Daily,
        )
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].total, 42);
}

#[tokio::test]
async fn hourly_records_roll_up_into_daily_buckets() {
    let engine = TestEngine::new();
    let acme = tenant("acme");

    for hour in [0, 6, 12, 18] {
        engine
            .seed_record(
                &acme,
                MetricType::ComputeMillis,
                utc(&format!("2024-03-05T{hour:02}:30:00Z")),
                Granularity::Hourly,
                250,
                5,
            )
            .await;
    }

    let points = engine
        .meter
        .trends(
            &acme,
            MetricType::ComputeMillis,
            utc("2024-03-05T00:00:00Z"),
            utc("2024-03-06T00:00:00Z"),
            Granularity::Daily,
        )
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].bucket_start, utc("2024-03-05T00:00:00Z"));
    assert_eq!(points[0].total, 1000);
    assert_eq!(points[0].count, 20);
}

#[tokio::test]
async fn empty_window_returns_no_points() {
    let engine = TestEngine::new();
    let acme = tenant("acme");

    let points = engine
        .meter
        .trends(
            &acme,
            MetricType::ApiCalls,
            utc("2024-03-01T00:00:00Z"),
            utc("2024-04-01T00:00:00Z"),
            Granularity::Daily,
        )
        .await
        .unwrap();
    assert!(points.is_empty());
}
