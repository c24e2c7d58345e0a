// In-memory bus.
//
// Single topic, fixed partition count, offsets are vector indices. Records
// are retained after delivery so a consumer group that restarts resumes from
// its committed offsets and re-reads anything uncommitted - the same
// at-least-once shape the Kafka adapter provides.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{BusConsumer, BusError, BusProducer, BusRecord};

#[derive(Debug)]
struct Inner {
    partitions: Vec<Mutex<Vec<Bytes>>>,
    committed: Mutex<HashMap<String, Vec<i64>>>,
    notify: Notify,
}

/// Handle to an in-memory topic. Clone to share between producers and
/// consumers.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new(partitions: usize) -> Self {
        let partitions = partitions.max(1);
        Self {
            inner: Arc::new(Inner {
                partitions: (0..partitions).map(|_| Mutex::new(Vec::new())).collect(),
                committed: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Create a consumer for `group`, resuming from committed offsets.
    pub fn consumer(&self, group: &str) -> MemoryConsumer {
        let positions = self
            .inner
            .committed
            .lock()
            .get(group)
            .cloned()
            .unwrap_or_else(|| vec![0; self.inner.partitions.len()]);
        MemoryConsumer {
            inner: Arc::clone(&self.inner),
            group: group.to_owned(),
            positions,
        }
    }

    /// Total records ever published; test helper.
    pub fn depth(&self) -> usize {
        self.inner.partitions.iter().map(|p| p.lock().len()).sum()
    }
}

fn partition_of(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

#[derive(Debug, Clone)]
pub struct MemoryProducer {
    inner: Arc<Inner>,
}

#[async_trait]
impl BusProducer for MemoryProducer {
    async fn publish(&self, key: &str, payload: Bytes) -> Result<(), BusError> {
        let partition = partition_of(key, self.inner.partitions.len());
        self.inner.partitions[partition].lock().push(payload);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn flush(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

pub struct MemoryConsumer {
    inner: Arc<Inner>,
    group: String,
    /// Next offset to hand out per partition. Runs ahead of the committed
    /// offset between poll and commit.
    positions: Vec<i64>,
}

impl MemoryConsumer {
    fn try_collect(&mut self, max: usize) -> Vec<BusRecord> {
        let mut out = Vec::new();
        for (partition, records) in self.inner.partitions.iter().enumerate() {
            if out.len() >= max {
                break;
            }
            let records = records.lock();
            let mut next = self.positions[partition];
            while (next as usize) < records.len() && out.len() < max {
                out.push(BusRecord {
                    partition: partition as i32,
                    offset: next,
                    payload: records[next as usize].clone(),
                });
                next += 1;
            }
            self.positions[partition] = next;
        }
        out
    }
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<BusRecord>, BusError> {
        let deadline = Instant::now() + timeout;
        let inner = Arc::clone(&self.inner);
        loop {
            let notified = inner.notify.notified();
            let records = self.try_collect(max);
            if !records.is_empty() {
                return Ok(records);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // Wait for a publish or the deadline, whichever first.
            let _ = tokio::time::timeout(remaining, notified).await;
            if Instant::now() >= deadline {
                return Ok(self.try_collect(max));
            }
        }
    }

    async fn commit(&mut self, offsets: &[(i32, i64)]) -> Result<(), BusError> {
        let mut committed = self.inner.committed.lock();
        let entry = committed
            .entry(self.group.clone())
            .or_insert_with(|| vec![0; self.inner.partitions.len()]);
        for &(partition, offset) in offsets {
            let slot = entry
                .get_mut(partition as usize)
                .ok_or_else(|| BusError::fatal(format!("unknown partition {partition}")))?;
            *slot = (*slot).max(offset + 1);
        }
        Ok(())
    }

    async fn lag(&self) -> Result<u64, BusError> {
        let committed = self.inner.committed.lock();
        let base = committed.get(&self.group);
        let mut lag = 0u64;
        for (partition, records) in self.inner.partitions.iter().enumerate() {
            let end = records.lock().len() as i64;
            let done = base.map_or(0, |v| v[partition]);
            lag += (end - done).max(0) as u64;
        }
        Ok(lag)
    }
}
