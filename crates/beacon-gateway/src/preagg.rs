// Sharded pre-aggregation buffer.
//
// Samples sharing an aggregation key within a minute collapse into one
// accumulator before they ever reach the bus. The buffer is sharded by key
// hash with one lock per shard; handler tasks touching different keys do
// not contend. Entries leave the buffer when their window expires or when
// the global key count hits the configured ceiling.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use beacon_core::{Accumulator, AggregationKey, MetricSample};
use parking_lot::Mutex;

const SHARD_COUNT: usize = 16;

struct Entry {
    acc: Accumulator,
    opened: Instant,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<AggregationKey, Entry>,
}

pub struct PreAggregator {
    shards: Vec<Mutex<Shard>>,
    window: Duration,
    max_keys: usize,
    key_count: AtomicUsize,
}

impl PreAggregator {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect(),
            window,
            max_keys: max_keys.max(1),
            key_count: AtomicUsize::new(0),
        }
    }

    fn shard_of(&self, key: &AggregationKey) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % SHARD_COUNT as u64) as usize]
    }

    /// Buffer a sample if it is aggregatable. Returns `false` when the
    /// sample has no aggregation key and must be published raw.
    pub fn ingest(&self, sample: &MetricSample) -> bool {
        let Some(key) = AggregationKey::of(sample) else {
            return false;
        };
        let mut shard = self.shard_of(&key).lock();
        let entry = shard.entries.entry(key).or_insert_with(|| {
            self.key_count.fetch_add(1, Ordering::Relaxed);
            Entry {
                acc: Accumulator::new(sample.metric_type),
                opened: Instant::now(),
            }
        });
        entry.acc.observe(sample);
        true
    }

    /// True when the buffer has reached its key ceiling and must flush.
    pub fn over_capacity(&self) -> bool {
        self.key_count.load(Ordering::Relaxed) >= self.max_keys
    }

    pub fn buffered_keys(&self) -> usize {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Remove and return entries whose window has expired; when the key
    /// ceiling has been reached, everything is flushed.
    pub fn drain_due(&self, now: Instant) -> Vec<(AggregationKey, Accumulator)> {
        if self.over_capacity() {
            return self.drain_all();
        }
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            let due: Vec<AggregationKey> = shard
                .entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.opened) >= self.window)
                .map(|(k, _)| k.clone())
                .collect();
            for key in due {
                if let Some(entry) = shard.entries.remove(&key) {
                    self.key_count.fetch_sub(1, Ordering::Relaxed);
                    out.push((key, entry.acc));
                }
            }
        }
        out
    }

    /// Flush everything, e.g. on shutdown.
    pub fn drain_all(&self) -> Vec<(AggregationKey, Accumulator)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            for (key, entry) in shard.entries.drain() {
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                out.push((key, entry.acc));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::MetricType;

    fn sample(endpoint: Option<&str>, value: f64) -> MetricSample {
        MetricSample {
            timestamp: 1_700_000_000_000,
            service_name: "api".into(),
            metric_name: "http.duration".into(),
            metric_type: MetricType::Histogram,
            value,
            endpoint: endpoint.map(str::to_owned),
            method: Some("GET".into()),
            status_code: Some(200),
            duration_ms: Some(value),
            tags: None,
            trace_id: None,
            span_id: None,
            environment: None,
        }
    }

    #[test]
    fn test_samples_without_endpoint_bypass() {
        let preagg = PreAggregator::new(Duration::from_secs(60), 100);
        assert!(!preagg.ingest(&sample(None, 1.0)));
        assert!(preagg.ingest(&sample(Some("/u"), 1.0)));
        assert_eq!(preagg.buffered_keys(), 1);
    }

    #[test]
    fn test_same_key_accumulates() {
        let preagg = PreAggregator::new(Duration::from_secs(60), 100);
        preagg.ingest(&sample(Some("/u"), 10.0));
        preagg.ingest(&sample(Some("/u"), 20.0));
        assert_eq!(preagg.buffered_keys(), 1);
        let drained = preagg.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.count, 2);
        assert_eq!(drained[0].1.sum, 30.0);
        assert_eq!(preagg.buffered_keys(), 0);
    }

    #[test]
    fn test_window_expiry_drains() {
        let preagg = PreAggregator::new(Duration::from_millis(0), 100);
        preagg.ingest(&sample(Some("/u"), 1.0));
        // Zero-length window: due immediately.
        let drained = preagg.drain_due(Instant::now());
        assert_eq!(drained.len(), 1);
    }

    #[test]
    fn test_unexpired_entries_stay() {
        let preagg = PreAggregator::new(Duration::from_secs(3_600), 100);
        preagg.ingest(&sample(Some("/u"), 1.0));
        assert!(preagg.drain_due(Instant::now()).is_empty());
        assert_eq!(preagg.buffered_keys(), 1);
    }

    #[test]
    fn test_key_ceiling_flushes_everything() {
        let preagg = PreAggregator::new(Duration::from_secs(3_600), 2);
        preagg.ingest(&sample(Some("/a"), 1.0));
        preagg.ingest(&sample(Some("/b"), 1.0));
        assert!(preagg.over_capacity());
        let drained = preagg.drain_due(Instant::now());
        assert_eq!(drained.len(), 2);
        assert!(!preagg.over_capacity());
    }
}
