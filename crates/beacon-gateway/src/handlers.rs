// HTTP request handlers for the ingest gateway.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use beacon_core::{
    validate_batch, Accumulator, AggregationKey, Fault, MetricBatch, RecordSet, StoredRow,
};
use bytes::Bytes;
use chrono::Utc;
use metrics::{counter, decrement_gauge, histogram, increment_gauge};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::publish::publish_with_retry;
use crate::stats::GatewayStats;
use crate::{AppError, AppState};

/// POST /v1/metrics - batch ingest endpoint.
pub(crate) async fn ingest(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    increment_gauge!("beacon_gateway_inflight_requests", 1.0);
    let start = Instant::now();
    let result = ingest_inner(&state, connect, &headers, body).await;
    decrement_gauge!("beacon_gateway_inflight_requests", 1.0);
    histogram!(
        "beacon_gateway_ingest_latency_ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
    match &result {
        Ok(_) => counter!("beacon_gateway_requests_total", 1, "outcome" => "accepted"),
        Err(e) => {
            counter!("beacon_gateway_requests_total", 1, "outcome" => outcome_label(e.status()))
        }
    }
    result
}

fn outcome_label(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::PAYLOAD_TOO_LARGE => "too_large",
        StatusCode::TOO_MANY_REQUESTS => "rate_limited",
        StatusCode::SERVICE_UNAVAILABLE => "bus_unavailable",
        _ => "error",
    }
}

impl AppError {
    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }
}

async fn ingest_inner(
    state: &AppState,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    // Authentication, when enabled. No detail leaks on failure.
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if state.config.auth_enabled {
        let authorized = api_key
            .as_deref()
            .is_some_and(|k| state.config.api_keys.iter().any(|allowed| allowed == k));
        if !authorized {
            GatewayStats::bump(&state.stats.rejected_auth);
            return Err(Fault::Auth.into());
        }
    }

    // Admission control: one token per request, drained atomically.
    let identity = if state.config.auth_enabled {
        api_key.unwrap_or_default()
    } else {
        connect
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "anonymous".to_string())
    };
    if let Err(retry_after_secs) = state.limiter.try_acquire(&identity) {
        GatewayStats::bump(&state.stats.rejected_rate_limited);
        return Err(Fault::Overload { retry_after_secs }.into());
    }

    let batch: MetricBatch = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("malformed batch envelope: {e}")))?;

    if batch.metrics.len() > state.config.max_batch_size {
        GatewayStats::bump(&state.stats.rejected_too_large);
        return Err(AppError::too_large(
            batch.metrics.len(),
            state.config.max_batch_size,
        ));
    }

    let errors = validate_batch(&batch);
    if !errors.is_empty() {
        GatewayStats::bump(&state.stats.rejected_validation);
        return Err(Fault::Validation { errors }.into());
    }

    let received_at = Utc::now().timestamp_millis();
    let sample_count = batch.metrics.len();
    let envelope_environment = batch.environment.clone();

    // Route each sample: aggregatable ones enter the buffer, the rest go
    // raw. Expired buffer windows ride along with this request's publish.
    let mut rows: Vec<StoredRow> = Vec::with_capacity(sample_count);
    if let Some(preagg) = &state.preagg {
        for sample in batch.metrics {
            if !preagg.ingest(&sample) {
                rows.push(StoredRow::from_sample(
                    state.ids.next(received_at),
                    sample,
                    envelope_environment.as_deref(),
                ));
            }
        }
        for (key, acc) in preagg.drain_due(Instant::now()) {
            rows.push(acc.into_row(state.ids.next(received_at), &key));
        }
    } else {
        for sample in batch.metrics {
            rows.push(StoredRow::from_sample(
                state.ids.next(received_at),
                sample,
                envelope_environment.as_deref(),
            ));
        }
    }

    let published = publish_rows(state, rows).await?;

    GatewayStats::bump(&state.stats.accepted_requests);
    GatewayStats::add(&state.stats.accepted_samples, sample_count as u64);
    debug!(samples = sample_count, published, "batch accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "samples": sample_count,
            "published_records": published,
        })),
    )
        .into_response())
}

/// Publish rows keyed by service so per-service ordering survives the bus.
/// All-or-nothing from the client's perspective: any failure is non-2xx.
pub(crate) async fn publish_rows(state: &AppState, rows: Vec<StoredRow>) -> Result<usize, AppError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut by_service: BTreeMap<String, Vec<StoredRow>> = BTreeMap::new();
    for row in rows {
        by_service.entry(row.service_name.clone()).or_default().push(row);
    }

    let mut published = 0usize;
    for (service, rows) in by_service {
        let count = rows.len();
        let payload = RecordSet::new(rows)
            .to_bytes()
            .map_err(|e| AppError::from(Fault::Internal { reason: e.to_string() }))?;
        publish_with_retry(
            state.bus.as_ref(),
            &service,
            Bytes::from(payload),
            state.config.publish_retry_budget,
        )
        .await
        .map_err(|e| {
            GatewayStats::bump(&state.stats.publish_failures);
            AppError::from(e)
        })?;
        GatewayStats::add(&state.stats.published_records, count as u64);
        published += count;
    }
    Ok(published)
}

/// Flush expired pre-aggregation windows; called by the background ticker.
pub(crate) async fn flush_due(state: &AppState) {
    let Some(preagg) = &state.preagg else { return };
    let drained = preagg.drain_due(Instant::now());
    if !drained.is_empty() {
        publish_drained(state, drained).await;
    }
}

/// Best-effort publish of drained accumulators outside a request context.
pub(crate) async fn publish_drained(state: &AppState, drained: Vec<(AggregationKey, Accumulator)>) {
    let now = Utc::now().timestamp_millis();
    let rows: Vec<StoredRow> = drained
        .into_iter()
        .map(|(key, acc)| acc.into_row(state.ids.next(now), &key))
        .collect();
    let count = rows.len();
    match publish_rows(state, rows).await {
        Ok(published) => info!(records = published, "flushed pre-aggregated records"),
        Err(_) => {
            counter!("beacon_gateway_preagg_dropped_total", 1);
            warn!(records = count, "dropping pre-aggregated records after publish failure");
        }
    }
}

/// GET /healthz and /live - process liveness.
pub(crate) async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// GET /readyz - the bus must be reachable before we accept traffic.
pub(crate) async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.bus.healthy().await {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "bus unreachable"})),
        )
    }
}

/// GET /v1/stats - admission counter snapshot.
pub(crate) async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let mut value = serde_json::to_value(state.stats.snapshot()).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.insert("tracked_identities".into(), json!(state.limiter.tracked_identities()));
        map.insert(
            "buffered_preagg_keys".into(),
            json!(state.preagg.as_ref().map(|p| p.buffered_keys()).unwrap_or(0)),
        );
    }
    Json(value)
}

/// GET /metrics - Prometheus text exposition.
pub(crate) async fn prometheus(State(state): State<AppState>) -> Response {
    let body = state.prom.as_ref().map(|h| h.render()).unwrap_or_default();
    ([("content-type", "text/plain; version=0.0.4")], body).into_response()
}
