// Counter snapshot served at /v1/stats.
//
// These are process-local admission counters; the Prometheus registry at
// /metrics carries the full label sets.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct GatewayStats {
    pub accepted_requests: AtomicU64,
    pub accepted_samples: AtomicU64,
    pub rejected_validation: AtomicU64,
    pub rejected_auth: AtomicU64,
    pub rejected_rate_limited: AtomicU64,
    pub rejected_too_large: AtomicU64,
    pub publish_failures: AtomicU64,
    pub published_records: AtomicU64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted_requests: u64,
    pub accepted_samples: u64,
    pub rejected_validation: u64,
    pub rejected_auth: u64,
    pub rejected_rate_limited: u64,
    pub rejected_too_large: u64,
    pub publish_failures: u64,
    pub published_records: u64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted_requests: self.accepted_requests.load(Ordering::Relaxed),
            accepted_samples: self.accepted_samples.load(Ordering::Relaxed),
            rejected_validation: self.rejected_validation.load(Ordering::Relaxed),
            rejected_auth: self.rejected_auth.load(Ordering::Relaxed),
            rejected_rate_limited: self.rejected_rate_limited.load(Ordering::Relaxed),
            rejected_too_large: self.rejected_too_large.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            published_records: self.published_records.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
