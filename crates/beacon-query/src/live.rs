// Live push channel.
//
// Each connection tails the store with its own cursor: every poll interval
// the handler fetches rows newer than the cursor and pushes them as JSON
// text frames. There is no fan-out from the ingest path; a storage outage
// stalls the tail but cannot wedge delivery for other connections.
//
// Backpressure: a bounded per-connection buffer drops the oldest messages
// on overflow and reports one `{"dropped": N}` control frame; the socket
// stays open. Heartbeat pings go out every 30s and a peer that misses two
// is disconnected.

use std::collections::VecDeque;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use beacon_store::{RowFilter, TimeWindow};
use chrono::Utc;
use metrics::{counter, decrement_gauge, increment_gauge};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_HEARTBEATS: u32 = 2;

#[derive(Debug, Deserialize)]
pub(crate) struct LiveParams {
    #[serde(default)]
    service: Option<String>,
}

/// GET /ws/metrics?service= - upgrade to the live channel.
pub(crate) async fn ws_metrics(
    State(state): State<AppState>,
    Query(params): Query<LiveParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| live_loop(state, params.service, socket))
}

async fn live_loop(state: AppState, service: Option<String>, mut socket: WebSocket) {
    increment_gauge!("beacon_query_live_connections", 1.0);
    let _guard = scopeguard();

    let filter = RowFilter {
        service,
        ..RowFilter::default()
    };
    let poll = Duration::from_millis(state.config.query.live_poll_ms.max(100));
    let capacity = state.config.query.live_buffer.max(1);

    let mut poll_tick = tokio::time::interval(poll);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The first interval tick fires immediately; consume both.
    poll_tick.tick().await;
    heartbeat.tick().await;

    let mut cursor = Utc::now().timestamp_millis() - poll.as_millis() as i64;
    let mut buffer: VecDeque<String> = VecDeque::with_capacity(capacity);
    let mut missed_pongs = 0u32;

    loop {
        tokio::select! {
            _ = poll_tick.tick() => {
                let now = Utc::now().timestamp_millis();
                let window = TimeWindow::new(cursor, now + 1);
                let rows = match state.store.query_range(&filter, &window, capacity * 4).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        // The tail stalls during a storage hiccup but the
                        // connection survives.
                        warn!(error = %e, "live tail query failed");
                        continue;
                    }
                };

                let mut dropped = 0u64;
                for row in rows {
                    cursor = cursor.max(row.timestamp + 1);
                    let frame = match serde_json::to_string(&row) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    if buffer.len() >= capacity {
                        buffer.pop_front();
                        dropped += 1;
                    }
                    buffer.push_back(frame);
                }

                while let Some(frame) = buffer.pop_front() {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        debug!("live peer went away mid-send");
                        return;
                    }
                }
                if dropped > 0 {
                    counter!("beacon_query_live_dropped_total", dropped);
                    let control = json!({ "dropped": dropped }).to_string();
                    if socket.send(Message::Text(control)).await.is_err() {
                        return;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if missed_pongs >= MAX_MISSED_HEARTBEATS {
                    debug!("closing silent live peer");
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                missed_pongs += 1;
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(Message::Pong(_))) => missed_pongs = 0,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "live socket error");
                        return;
                    }
                }
            }
        }
    }
}

struct ConnectionGuard;

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        decrement_gauge!("beacon_query_live_connections", 1.0);
    }
}

fn scopeguard() -> ConnectionGuard {
    ConnectionGuard
}
