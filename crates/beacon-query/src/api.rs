// HTTP handlers for range queries, health scores, alerts, VQL and
// comparisons.
//
// User input becomes typed filter fields and whitelisted group columns;
// nothing is ever spliced into a query as text.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use beacon_store::{AggregateBucket, GroupColumn, RowFilter, TimeWindow};
use chrono::Utc;
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::json;

use crate::compare::{compare_services, CompareRequest};
use crate::health;
use crate::vql;
use crate::{AppError, AppState};

const MIN_BUCKET_MS: i64 = 60_000;
const MAX_BUCKET_MS: i64 = 86_400_000;
const SERVICES_WINDOW_S: u64 = 24 * 3_600;

#[derive(Debug, Deserialize)]
pub(crate) struct RangeParams {
    service: Option<String>,
    metric: Option<String>,
    environment: Option<String>,
    /// Window length in seconds, ending now.
    range: Option<u64>,
    group_by: Option<String>,
}

fn bucket_json(bucket: &AggregateBucket) -> serde_json::Value {
    let mut value = json!({
        "bucket_start": bucket.bucket_start,
        "count": bucket.count,
        "avg": bucket.avg,
        "min": bucket.min,
        "max": bucket.max,
        "p95": bucket.p95,
        "error_count": bucket.error_count,
    });
    if let Some(group) = &bucket.group {
        value["group"] = json!(group);
    }
    value
}

fn parse_range(state: &AppState, params: &RangeParams) -> Result<(RowFilter, TimeWindow, i64), AppError> {
    let service = params
        .service
        .clone()
        .ok_or_else(|| AppError::bad_request("missing required parameter: service"))?;
    let range_s = params.range.unwrap_or(state.config.query.default_range_s).max(1);
    let now = Utc::now().timestamp_millis();
    let window = TimeWindow::last(range_s, now);
    // A tenth of the range, clamped to [1 minute, 1 day].
    let bucket_ms = ((range_s as i64) * 1_000 / 10).clamp(MIN_BUCKET_MS, MAX_BUCKET_MS);
    let filter = RowFilter {
        service: Some(service),
        metric: params.metric.clone(),
        environment: params.environment.clone(),
        ..RowFilter::default()
    };
    Ok((filter, window, bucket_ms))
}

/// GET /api/metrics/timeseries
pub(crate) async fn timeseries(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Result<Response, AppError> {
    let start = std::time::Instant::now();
    let (filter, window, bucket_ms) = parse_range(&state, &params)?;
    let group = match &params.group_by {
        None => None,
        Some(name) => Some(
            GroupColumn::parse(name)
                .ok_or_else(|| AppError::bad_request(format!("cannot group by {name}")))?,
        ),
    };

    let buckets = state
        .store
        .query_aggregates(&filter, &window, bucket_ms, group)
        .await?;
    histogram!(
        "beacon_query_request_latency_ms",
        start.elapsed().as_secs_f64() * 1000.0,
        "endpoint" => "timeseries"
    );
    let body: Vec<serde_json::Value> = buckets.iter().map(bucket_json).collect();
    Ok(Json(body).into_response())
}

/// GET /api/metrics/aggregated - one object across the whole window.
pub(crate) async fn aggregated(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Result<Response, AppError> {
    let (filter, window, _) = parse_range(&state, &params)?;
    let body = match state.store.aggregate_window(&filter, &window).await? {
        Some(bucket) => bucket_json(&bucket),
        None => json!({
            "bucket_start": window.start_ms,
            "count": 0,
            "avg": 0.0,
            "min": 0.0,
            "max": 0.0,
            "p95": 0.0,
            "error_count": 0,
        }),
    };
    Ok(Json(body).into_response())
}

/// GET /api/services - services seen in the last 24 hours.
pub(crate) async fn services(State(state): State<AppState>) -> Result<Response, AppError> {
    let now = Utc::now().timestamp_millis();
    let window = TimeWindow::last(SERVICES_WINDOW_S, now);
    let services = state.store.list_services(&window).await?;
    Ok(Json(services).into_response())
}

/// GET /health/scores - health score per recently-seen service.
pub(crate) async fn health_scores(State(state): State<AppState>) -> Result<Response, AppError> {
    let now = Utc::now().timestamp_millis();
    let discovery = TimeWindow::last(SERVICES_WINDOW_S, now);
    let window = TimeWindow::last(state.config.health.window_s, now);

    let mut scores = Vec::new();
    for service in state.store.list_services(&discovery).await? {
        let stats = state.store.service_window_stats(&service, &window).await?;
        scores.push(health::compute(&state.config.health, &service, &stats));
    }
    Ok(Json(scores).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct AlertParams {
    limit: Option<usize>,
}

/// GET /alerts?limit= - alert records, newest first.
pub(crate) async fn alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertParams>,
) -> Result<Response, AppError> {
    let limit = params.limit.unwrap_or(100).min(1_000);
    let alerts = state.store.list_alerts(limit).await?;
    Ok(Json(alerts).into_response())
}

/// GET /alerts/active - alerts currently firing.
pub(crate) async fn alerts_active(State(state): State<AppState>) -> Result<Response, AppError> {
    let alerts = state.store.active_alerts().await?;
    Ok(Json(alerts).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct VqlRequest {
    query: String,
}

/// POST /vql/execute
pub(crate) async fn vql_execute(
    State(state): State<AppState>,
    Json(request): Json<VqlRequest>,
) -> Result<Response, AppError> {
    let query = match vql::parse(&request.query) {
        Ok(query) => query,
        Err(e) => {
            counter!("beacon_query_vql_rejected_total", 1);
            return Err(AppError::invalid_query(e));
        }
    };
    let now = Utc::now().timestamp_millis();
    let rows = match vql::execute(&state.store, &query, now).await {
        Ok(rows) => rows,
        Err(vql::ExecError::Invalid(e)) => return Err(AppError::invalid_query(e)),
        Err(vql::ExecError::Store(e)) => return Err(AppError::from(e)),
    };
    counter!("beacon_query_vql_executed_total", 1);
    Ok(Json(json!({ "rows": rows })).into_response())
}

/// POST /compare/services
pub(crate) async fn compare(
    State(state): State<AppState>,
    Json(request): Json<CompareRequest>,
) -> Result<Response, AppError> {
    if request.time_end <= request.time_start {
        return Err(AppError::bad_request("time_end must be after time_start"));
    }
    let comparison = compare_services(&state.store, &request).await?;
    Ok(Json(comparison).into_response())
}

/// GET /healthz and /live.
pub(crate) async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// GET /readyz - the store must answer before we serve queries.
pub(crate) async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.healthy().await {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "store unreachable"})),
        )
    }
}

/// GET /metrics - Prometheus text exposition.
pub(crate) async fn prometheus(State(state): State<AppState>) -> Response {
    let body = state.prom.as_ref().map(|h| h.render()).unwrap_or_default();
    ([("content-type", "text/plain; version=0.0.4")], body).into_response()
}
