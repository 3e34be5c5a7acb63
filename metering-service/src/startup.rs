//! Application startup and lifecycle management.

use crate::config::MeteringConfig;
use crate::services::{
    get_metrics, init_metrics, BillingCalculator, Clock, CounterStore, Database,
    InMemoryCounterStore, MeteringService, RateLimiter, RedisCounterStore, SubscriptionManager,
    SystemClock, TierCatalog, UsageLedger,
};
use crate::services::store::{ApiKeyStore, InvoiceStore, OrgStore};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use metering_core::error::AppError;
use metering_core::middleware::metrics::metrics_middleware;
use metering_core::middleware::tracing::request_id_middleware;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: MeteringConfig,
    pub db: Arc<Database>,
    pub metering: Arc<MeteringService>,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
    metering: Arc<MeteringService>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let db_ok = state.db.health_check().await;
    let counters_ok = state.metering.counter_store_health().await;

    match (db_ok, counters_ok) {
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
        (db, counters) => {
            let detail = [
                db.err().map(|e| format!("database: {}", e)),
                counters.err().map(|e| format!("counter store: {}", e)),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("; ");
            tracing::warn!(error = %detail, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "metering-service",
                    "error": detail
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Readiness check passed");
            StatusCode::OK
        }
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
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: MeteringConfig, run_migrations: bool) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        // Connect to database
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

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        // Counter store: Redis shared across instances, or the in-process
        // store for single-instance deployments.
        let counters: Arc<dyn CounterStore> = if config.redis.url.is_empty() {
            tracing::warn!(
                "No Redis URL configured; falling back to the in-process counter store. \
                 Quota windows will not be shared across instances."
            );
            Arc::new(InMemoryCounterStore::new(clock.clone()))
        } else {
            Arc::new(
                RedisCounterStore::new(
                    &config.redis.url,
                    Duration::from_millis(config.quota.store_timeout_ms),
                )
                .await?,
            )
        };

        let catalog = TierCatalog::new();
        let orgs: Arc<dyn OrgStore> = db.clone();
        let keys: Arc<dyn ApiKeyStore> = db.clone();
        let invoices: Arc<dyn InvoiceStore> = db.clone();
        let ledger: Arc<dyn UsageLedger> = db.clone();

        let subscriptions =
            SubscriptionManager::new(orgs.clone(), keys, catalog, clock.clone());
        let limiter = RateLimiter::new(
            catalog,
            counters.clone(),
            ledger.clone(),
            clock.clone(),
            config.quota.policy(),
        );
        let billing =
            BillingCalculator::new(orgs, invoices, ledger.clone(), catalog, clock.clone());
        let metering = Arc::new(MeteringService::new(
            subscriptions,
            limiter,
            billing,
            ledger,
            counters,
            catalog,
            clock,
        ));

        let state = AppState {
            config: config.clone(),
            db,
            metering,
        };

        // Bind HTTP listener
        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Metering service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a handle to the metering facade.
    pub fn metering(&self) -> Arc<MeteringService> {
        self.state.metering.clone()
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        // Operational surface only: health, readiness, Prometheus metrics.
        // Product API endpoints live in the services that embed this core.
        let health_state = HealthState {
            db: self.state.db.clone(),
            metering: self.state.metering.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        tracing::info!(
            service = "metering-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, http_router).await?;
        Ok(())
    }
}
