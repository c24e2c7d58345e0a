// beacon-gateway - HTTP ingest gateway
//
// Request path: authenticate, rate-limit, validate, pre-aggregate, publish
// to the bus, 202. Samples never reach storage from here; the stream worker
// owns the write side. A background task flushes expired pre-aggregation
// windows so buffered keys are published even when ingest traffic pauses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use beacon_bus::{BusError, BusProducer, MemoryBus};
use beacon_config::{BeaconConfig, BusKind, GatewayConfig};
use beacon_core::{ErrorBody, Fault, IdGenerator};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

mod handlers;
mod preagg;
mod publish;
mod ratelimit;
mod stats;

pub use preagg::PreAggregator;
pub use ratelimit::RateLimiter;
pub use stats::{GatewayStats, StatsSnapshot};

/// Shared state for all gateway requests.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<dyn BusProducer>,
    pub limiter: Arc<RateLimiter>,
    pub preagg: Option<Arc<PreAggregator>>,
    pub ids: Arc<IdGenerator>,
    pub config: Arc<GatewayConfig>,
    pub stats: Arc<GatewayStats>,
    pub prom: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: &BeaconConfig,
        bus: Arc<dyn BusProducer>,
        prom: Option<PrometheusHandle>,
    ) -> Self {
        let gw = &config.gateway;
        let preagg = if gw.preagg_enabled {
            Some(Arc::new(PreAggregator::new(
                Duration::from_secs(gw.preagg_window_s),
                gw.preagg_max_keys,
            )))
        } else {
            None
        };
        Self {
            bus,
            limiter: Arc::new(RateLimiter::new(gw.rate_limit_capacity, gw.rate_limit_rpm)),
            preagg,
            ids: Arc::new(IdGenerator::new(gw.node_id)),
            config: Arc::new(gw.clone()),
            stats: Arc::new(GatewayStats::default()),
            prom,
        }
    }
}

/// Error type that implements IntoResponse with the machine-readable
/// `{code, message, details?}` body.
pub struct AppError {
    status: StatusCode,
    retry_after: Option<u64>,
    body: ErrorBody,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            retry_after: None,
            body: ErrorBody {
                code: "validation",
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn too_large(size: usize, limit: usize) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            retry_after: None,
            body: ErrorBody {
                code: "validation",
                message: format!("batch of {size} samples exceeds limit of {limit}"),
                details: None,
            },
        }
    }
}

impl From<Fault> for AppError {
    fn from(fault: Fault) -> Self {
        let retry_after = match &fault {
            Fault::Overload { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        Self {
            status: StatusCode::from_u16(fault.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            retry_after,
            body: fault.body(),
        }
    }
}

impl From<BusError> for AppError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Retryable { reason, .. } => Fault::Retryable { reason }.into(),
            BusError::Fatal { reason } => Fault::Internal { reason }.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.body.message, "request failed");
        }
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    let deadline = Duration::from_secs(state.config.request_deadline_s);
    Router::new()
        .route("/v1/metrics", post(handlers::ingest))
        .route("/v1/stats", get(handlers::stats))
        .route("/healthz", get(handlers::healthz))
        .route("/live", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::prometheus))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(deadline))
        .with_state(state)
}

/// Construct the bus producer named by configuration.
pub fn build_producer(config: &BeaconConfig) -> Result<Arc<dyn BusProducer>> {
    match config.bus.kind {
        BusKind::Memory => {
            warn!("memory bus selected: records are visible only inside this process");
            Ok(Arc::new(MemoryBus::new(config.bus.partitions).producer()))
        }
        BusKind::Kafka => build_kafka_producer(config),
    }
}

#[cfg(feature = "kafka")]
fn build_kafka_producer(config: &BeaconConfig) -> Result<Arc<dyn BusProducer>> {
    let producer = beacon_bus::KafkaBusProducer::new(&config.bus.brokers, &config.bus.topic)
        .map_err(|e| anyhow::anyhow!("kafka producer init: {e}"))?;
    Ok(Arc::new(producer))
}

#[cfg(not(feature = "kafka"))]
fn build_kafka_producer(_config: &BeaconConfig) -> Result<Arc<dyn BusProducer>> {
    anyhow::bail!("bus.kind = kafka but this binary was built without the kafka feature")
}

/// Entry point: build everything from configuration and serve until SIGTERM.
pub async fn run(config: BeaconConfig) -> Result<()> {
    let bus = build_producer(&config)?;
    serve(config, bus, shutdown_signal()).await
}

/// Serve with an injected bus and shutdown future; composition point for
/// the single-process mode and the test suite.
pub async fn serve(
    config: BeaconConfig,
    bus: Arc<dyn BusProducer>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let prom = install_prometheus();
    let state = AppState::new(&config, bus, prom);
    let addr = config.gateway.listen_addr.clone();

    let flusher = tokio::spawn(run_flusher(state.clone()));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(addr = %addr, "ingest gateway listening");

    axum::serve(
        listener,
        router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("gateway server error")?;

    flusher.abort();

    // Final drain: publish whatever is still buffered before exit.
    flush_all(&state).await;
    let _ = state.bus.flush().await;
    info!("gateway shutdown complete");
    Ok(())
}

/// Publish every buffered pre-aggregation window immediately.
pub async fn flush_all(state: &AppState) {
    if let Some(preagg) = &state.preagg {
        let drained = preagg.drain_all();
        if !drained.is_empty() {
            info!(keys = drained.len(), "flushing pre-aggregation buffer");
            handlers::publish_drained(state, drained).await;
        }
    }
}

/// Install the Prometheus recorder once per process; later calls (tests,
/// single-process mode) fall back to serving an empty exposition.
pub fn install_prometheus() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

async fn run_flusher(state: AppState) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        handlers::flush_due(&state).await;
    }
}

/// Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
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
