//! Application startup and lifecycle management.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::MeteringConfig;
use crate::error::AppError;
use crate::services::{
    event_channel, get_metrics, init_metrics, Clock, CounterStore, Database, EventWriter,
    FlushScheduler, PolicyRegistry, QuotaGate, RedisCounterStore, StaticPlanResolver, SystemClock,
    UsageLedger, UsageMeter,
};
use crate::models::PlanTier;

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    ledger: Arc<dyn UsageLedger>,
    store: Arc<dyn CounterStore>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let ledger = state.ledger.health_check().await;
    let store = state.store.health_check().await;
    match (&ledger, &store) {
        (Ok(_), Ok(_)) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "metering-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        _ => {
            let error = ledger
                .err()
                .or(store.err())
                .map(|e| e.to_string())
                .unwrap_or_default();
            tracing::warn!(error = %error, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "metering-service",
                    "error": error
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.ledger.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    meter: Arc<UsageMeter>,
    health: HealthState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        // Connect to the durable ledger
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;
        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;
        let db = Arc::new(db);

        // Connect to the hot counter store
        let store: Arc<dyn CounterStore> =
            Arc::new(RedisCounterStore::new(&config.redis.url).await?);

        let ledger: Arc<dyn UsageLedger> = db.clone();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let registry = Arc::new(PolicyRegistry::new(
            db.clone(),
            Arc::new(StaticPlanResolver::new(PlanTier::Free)),
            config.engine.policy_cache_ttl,
        ));

        // Background event writer
        let (event_tx, event_rx) = event_channel(config.engine.event_buffer);
        EventWriter::new(ledger.clone(), event_rx).spawn();

        let gate = QuotaGate::new(
            store.clone(),
            registry.clone(),
            clock.clone(),
            event_tx,
            config.engine.fallback,
            config.engine.hot_store_timeout,
        );

        let meter = Arc::new(UsageMeter::new(
            gate,
            registry,
            ledger.clone(),
            clock.clone(),
        ));

        // Background flush scheduler
        Arc::new(FlushScheduler::new(
            store.clone(),
            ledger.clone(),
            config.engine.sync_interval,
        ))
        .spawn();

        // Bind HTTP listener
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Metering service listener bound");

        Ok(Self {
            port,
            listener,
            meter,
            health: HealthState { ledger, store },
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a handle to the usage meter for embedding callers.
    pub fn meter(&self) -> Arc<UsageMeter> {
        self.meter.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        // Minimal HTTP surface: health + metrics only. The engine itself is
        // consumed as a library.
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.health.clone());

        tracing::info!(
            service = "metering-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await
    }
}
