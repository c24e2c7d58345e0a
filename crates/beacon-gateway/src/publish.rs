// Bus publish with a bounded retry budget.
//
// Retryable publish failures back off exponentially (100ms doubling, capped
// at 2s); exhausting the budget surfaces as a 503 to the client. Fatal
// failures do not retry.

use std::time::Duration;

use beacon_bus::{BusError, BusProducer};
use bytes::Bytes;
use metrics::{counter, histogram};
use tracing::warn;

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 2_000;

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// Publish one payload, retrying transient failures up to `budget` attempts.
pub(crate) async fn publish_with_retry(
    bus: &dyn BusProducer,
    key: &str,
    payload: Bytes,
    budget: u32,
) -> Result<(), BusError> {
    let start = std::time::Instant::now();
    let attempts = budget.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match bus.publish(key, payload.clone()).await {
            Ok(()) => {
                histogram!(
                    "beacon_gateway_publish_latency_ms",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                return Ok(());
            }
            Err(e @ BusError::Fatal { .. }) => {
                counter!("beacon_gateway_publish_errors_total", 1, "kind" => "fatal");
                return Err(e);
            }
            Err(e) => {
                counter!("beacon_gateway_publish_errors_total", 1, "kind" => "retryable");
                warn!(attempt, error = %e, "bus publish failed, backing off");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| BusError::retryable("publish retry budget exhausted")))
}
