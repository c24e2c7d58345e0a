// beacon-query - query and signals service
//
// Serves historical range queries, the VQL read-only query language, a
// WebSocket live tail, per-service health scores, adaptive alerts and A/B
// service comparisons. Everything reads from the columnar store; this
// service never writes metric data, only alert records.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use beacon_config::BeaconConfig;
use beacon_core::ErrorBody;
use beacon_store::{Store, StoreError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

mod alerts;
mod api;
mod compare;
mod health;
mod live;
pub mod vql;

pub use alerts::{run_evaluator, AlertEngine};
pub use compare::{compare_services, CompareRequest, Comparison, SideStats};
pub use health::{compute as compute_health, HealthScore};

/// Shared state for all query requests.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<BeaconConfig>,
    pub prom: Option<PrometheusHandle>,
}

/// Error type with the machine-readable `{code, message, details?}` body.
pub struct AppError {
    status: StatusCode,
    body: ErrorBody,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                code: "validation",
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn invalid_query(e: vql::VqlError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                code: "invalid_query",
                message: e.message.clone(),
                details: Some(serde_json::json!({ "token": e.token })),
            },
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Retryable { reason } => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: ErrorBody {
                    code: "dependency_retryable",
                    message: reason,
                    details: None,
                },
            },
            StoreError::Fatal { reason } => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: ErrorBody {
                    code: "internal",
                    message: reason,
                    details: None,
                },
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.body.message, "query request failed");
        }
        (self.status, Json(self.body)).into_response()
    }
}

/// Build the query-service router.
pub fn router(state: AppState) -> Router {
    let deadline = Duration::from_secs(state.config.query.request_deadline_s);
    Router::new()
        .route("/api/metrics/timeseries", get(api::timeseries))
        .route("/api/metrics/aggregated", get(api::aggregated))
        .route("/api/services", get(api::services))
        .route("/health/scores", get(api::health_scores))
        .route("/alerts", get(api::alerts))
        .route("/alerts/active", get(api::alerts_active))
        .route("/vql/execute", post(api::vql_execute))
        .route("/compare/services", post(api::compare))
        .route("/ws/metrics", get(live::ws_metrics))
        .route("/healthz", get(api::healthz))
        .route("/live", get(api::healthz))
        .route("/readyz", get(api::readyz))
        .route("/metrics", get(api::prometheus))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(deadline))
        .with_state(state)
}

/// Entry point: build the store from configuration and serve until SIGTERM.
pub async fn run(config: BeaconConfig) -> Result<()> {
    let store = Arc::new(
        Store::from_config(&config.storage, &config.retention)
            .map_err(|e| anyhow::anyhow!("store init: {e}"))?,
    );
    serve(config, store, shutdown_signal()).await
}

/// Serve with an injected store and shutdown future.
pub async fn serve(
    config: BeaconConfig,
    store: Arc<Store>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let prom = PrometheusBuilder::new().install_recorder().ok();
    let config = Arc::new(config);
    let state = AppState {
        store: Arc::clone(&store),
        config: Arc::clone(&config),
        prom,
    };

    let engine = Arc::new(AlertEngine::new(store, config.alerting.clone()));
    let evaluator = tokio::spawn(run_evaluator(engine, config.alerting.eval_period_s));

    let addr = config.query.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(addr = %addr, "query service listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("query server error")?;

    evaluator.abort();
    info!("query service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}
