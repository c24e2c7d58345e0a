// beacon-bus - message bus adapter
//
// Contract: a single-topic, partitioned queue with per-partition FIFO order
// and at-least-once delivery. Records are keyed so one service always lands
// on one partition, preserving per-service ordering from gateway to worker.
//
// Two implementations: an in-memory bus (default configuration and the test
// suite) and a Kafka adapter behind the `kafka` cargo feature.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

mod memory;
#[cfg(feature = "kafka")]
mod kafka;

pub use memory::{MemoryBus, MemoryConsumer, MemoryProducer};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBusConsumer, KafkaBusProducer};

/// One consumed record with its position on the bus.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub partition: i32,
    pub offset: i64,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    /// Transient failure. `retry_after` is the broker's backoff hint.
    #[error("retryable bus failure: {reason}")]
    Retryable {
        reason: String,
        retry_after: Duration,
    },

    /// Permanent failure; retrying the same request cannot succeed.
    #[error("fatal bus failure: {reason}")]
    Fatal { reason: String },
}

impl BusError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        BusError::Retryable {
            reason: reason.into(),
            retry_after: Duration::from_millis(100),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        BusError::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Retryable { .. })
    }
}

/// Publishing side of the bus. Shared by handler tasks, hence `Sync`.
#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Publish one payload under a partition key. Resolves once the bus has
    /// acknowledged the record.
    async fn publish(&self, key: &str, payload: Bytes) -> Result<(), BusError>;

    /// Flush any internally buffered records.
    async fn flush(&self) -> Result<(), BusError>;

    /// Cheap reachability probe for readiness checks.
    async fn healthy(&self) -> bool;
}

/// Consuming side of the bus. One consumer per worker loop.
#[async_trait]
pub trait BusConsumer: Send {
    /// Poll up to `max` records, waiting at most `timeout`. An empty vector
    /// means the timeout elapsed with nothing to deliver.
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<BusRecord>, BusError>;

    /// Commit consumed offsets. `offsets` holds the highest processed offset
    /// per partition; everything at or below it is acknowledged.
    async fn commit(&mut self, offsets: &[(i32, i64)]) -> Result<(), BusError>;

    /// Total unconsumed backlog across assigned partitions (end offset minus
    /// committed offset). Drives the worker's adaptive batch sizing.
    async fn lag(&self) -> Result<u64, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BusError::retryable("broker away").is_retryable());
        assert!(!BusError::fatal("bad topic").is_retryable());
    }
}
