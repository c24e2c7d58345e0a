// beacon-worker - stream worker
//
// Consumes the bus, batches decoded rows, and writes them to the columnar
// store. Three cooperating concerns share the single consumer loop: size-
// and age-triggered batching, a circuit breaker that stops consumption
// while storage is down, and lag-adaptive batch sizing. Offsets commit only
// after storage acknowledges every row they cover.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use beacon_bus::{BusConsumer, BusError, BusRecord, MemoryBus};
use beacon_config::{BeaconConfig, BusKind, WorkerConfig};
use beacon_core::RecordSet;
use beacon_store::{InsertReceipt, Store, StoreError};
use metrics::{counter, gauge};
use tracing::{error, info, warn};

mod backpressure;
mod batcher;
mod breaker;
mod rollup;

pub use backpressure::target_batch_size;
pub use batcher::{Batch, PendingRecord};
pub use breaker::{BreakerState, CircuitBreaker, Gate};
pub use rollup::run_maintenance;

const POLL_FLOOR: Duration = Duration::from_millis(10);
const HOLD_SLICE: Duration = Duration::from_secs(1);

/// Write side of the worker; a seam so failure modes are testable without a
/// failing object store.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn insert(&self, rows: &[beacon_core::StoredRow]) -> Result<InsertReceipt, StoreError>;
}

#[async_trait]
impl Sink for Store {
    async fn insert(&self, rows: &[beacon_core::StoredRow]) -> Result<InsertReceipt, StoreError> {
        self.insert_rows(rows).await
    }
}

pub struct Worker<C: BusConsumer, S: Sink> {
    consumer: C,
    sink: Arc<S>,
    config: WorkerConfig,
    breaker: CircuitBreaker,
    batch: Batch,
}

impl<C: BusConsumer, S: Sink> Worker<C, S> {
    pub fn new(consumer: C, sink: Arc<S>, config: WorkerConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.breaker_fail_threshold,
            Duration::from_secs(config.breaker_cooldown_s),
        );
        Self {
            consumer,
            sink,
            config,
            breaker,
            batch: Batch::default(),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run until `shutdown` resolves, then flush, commit and return.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    return self.drain().await;
                }
                result = self.step() => result?,
            }
        }
    }

    /// One loop iteration. Public so tests can drive the worker manually.
    pub async fn step(&mut self) -> Result<()> {
        gauge!("beacon_worker_breaker_open", 0.0);
        match self.breaker.gate(tokio::time::Instant::now()) {
            Gate::Hold { remaining } => {
                gauge!("beacon_worker_breaker_open", 1.0);
                tokio::time::sleep(remaining.min(HOLD_SLICE)).await;
            }
            Gate::Probe => self.probe().await,
            Gate::Allow => self.consume_and_flush().await?,
        }
        Ok(())
    }

    async fn consume_and_flush(&mut self) -> Result<()> {
        let lag = match self.consumer.lag().await {
            Ok(lag) => lag,
            Err(e) => {
                warn!(error = %e, "lag probe failed, assuming zero backlog");
                0
            }
        };
        gauge!("beacon_worker_consumer_lag", lag as f64);
        let target = target_batch_size(
            self.config.target_batch_size,
            lag,
            self.config.batch_min,
            self.config.batch_max,
        );

        let max_age = Duration::from_millis(self.config.max_flush_interval_ms);
        let timeout = if self.batch.is_empty() {
            max_age
        } else {
            max_age
                .saturating_sub(self.batch.age(Instant::now()))
                .max(POLL_FLOOR)
        };
        let want = target.saturating_sub(self.batch.row_count()).max(1);

        match self.consumer.poll(want, timeout).await {
            Ok(records) => {
                counter!("beacon_worker_records_consumed_total", records.len() as u64);
                self.enqueue(records);
            }
            Err(BusError::Retryable { reason, retry_after }) => {
                warn!(reason = %reason, "bus poll failed, backing off");
                tokio::time::sleep(retry_after).await;
            }
            Err(BusError::Fatal { reason }) => {
                anyhow::bail!("bus consumer failed fatally: {reason}");
            }
        }

        if self
            .batch
            .should_flush(target, max_age, Instant::now())
        {
            self.flush().await;
        }
        Ok(())
    }

    fn enqueue(&mut self, records: Vec<BusRecord>) {
        for record in records {
            match RecordSet::from_bytes(&record.payload) {
                Ok(set) => self.batch.push(PendingRecord {
                    partition: record.partition,
                    offset: record.offset,
                    rows: set.rows,
                }),
                Err(e) => {
                    // Undecodable payload: dead-letter and keep the offset
                    // committable so the partition is not wedged.
                    counter!("beacon_worker_dead_letter_total", 1, "reason" => "decode");
                    error!(
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "undecodable bus record dropped to dead letter"
                    );
                    self.batch.push(PendingRecord {
                        partition: record.partition,
                        offset: record.offset,
                        rows: Vec::new(),
                    });
                }
            }
        }
    }

    /// Flush the pending batch: insert (with in-place retries), then commit.
    pub async fn flush(&mut self) {
        let rows = self.batch.rows();
        if rows.is_empty() {
            self.commit_batch().await;
            return;
        }

        match self.insert_with_retry(&rows).await {
            Ok(()) => {
                counter!("beacon_worker_rows_inserted_total", rows.len() as u64);
                self.breaker.on_success();
                self.commit_batch().await;
            }
            Err(e) if e.is_retryable() => {
                counter!("beacon_worker_insert_failures_total", 1, "kind" => "retryable");
                // Keep the batch; the breaker decides when to touch storage
                // again, and uncommitted offsets keep the bus as backstop.
                self.breaker.on_failure(tokio::time::Instant::now());
            }
            Err(e) => {
                counter!("beacon_worker_dead_letter_total", rows.len() as u64, "reason" => "fatal");
                error!(error = %e, rows = rows.len(), "fatal insert, batch dropped to dead letter");
                self.commit_batch().await;
            }
        }
    }

    async fn insert_with_retry(&self, rows: &[beacon_core::StoredRow]) -> Result<(), StoreError> {
        let attempts = self.config.insert_retry_attempts.max(1);
        let base = Duration::from_millis(self.config.insert_retry_base_ms);
        let mut last = StoreError::retryable("no attempt made");
        for attempt in 1..=attempts {
            match self.sink.insert(rows).await {
                Ok(_) => return Ok(()),
                Err(e @ StoreError::Fatal { .. }) => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "insert failed");
                    last = e;
                    if attempt < attempts {
                        // 2s, 4s, 8s with the defaults.
                        let exp = attempt.saturating_sub(1).min(8);
                        tokio::time::sleep(base.saturating_mul(1 << exp)).await;
                    }
                }
            }
        }
        Err(last)
    }

    /// Half-open probe: one small insert decides whether storage is back.
    async fn probe(&mut self) {
        if self.batch.is_empty() {
            match self.consumer.poll(self.config.batch_min, POLL_FLOOR.max(Duration::from_millis(100))).await {
                Ok(records) => self.enqueue(records),
                Err(e) => {
                    warn!(error = %e, "poll during probe failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    return;
                }
            }
        }
        let Some(record) = self.batch.pop_front() else {
            // Nothing to probe with; stay half-open until data arrives.
            tokio::time::sleep(Duration::from_millis(100)).await;
            return;
        };

        if record.rows.is_empty() {
            // Dead-lettered decode failure; just commit it.
            let _ = self.consumer.commit(&[(record.partition, record.offset)]).await;
            return;
        }

        match self.sink.insert(&record.rows).await {
            Ok(_) => {
                counter!("beacon_worker_rows_inserted_total", record.rows.len() as u64);
                info!(rows = record.rows.len(), "probe insert succeeded");
                self.breaker.on_success();
                if let Err(e) = self
                    .consumer
                    .commit(&[(record.partition, record.offset)])
                    .await
                {
                    warn!(error = %e, "commit after probe failed");
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "probe insert failed, reopening breaker");
                self.batch.push_front(record);
                self.breaker.on_failure(tokio::time::Instant::now());
            }
            Err(e) => {
                // Storage answered; the payload is the problem.
                counter!("beacon_worker_dead_letter_total", record.rows.len() as u64, "reason" => "fatal");
                error!(error = %e, "fatal insert during probe, record dead-lettered");
                self.breaker.on_success();
                let _ = self.consumer.commit(&[(record.partition, record.offset)]).await;
            }
        }
    }

    async fn commit_batch(&mut self) {
        let offsets = self.batch.commit_offsets();
        if !offsets.is_empty() {
            if let Err(e) = self.consumer.commit(&offsets).await {
                // Rows are stored; redelivery after restart dedupes by id.
                warn!(error = %e, "offset commit failed");
            }
        }
        self.batch.clear();
    }

    async fn drain(mut self) -> Result<()> {
        info!(
            rows = self.batch.row_count(),
            "graceful shutdown: flushing in-memory batch"
        );
        let deadline = Duration::from_secs(self.config.shutdown_deadline_s);
        if tokio::time::timeout(deadline, self.flush()).await.is_err() {
            warn!("shutdown deadline hit; uncommitted records stay on the bus");
        }
        info!("worker shutdown complete");
        Ok(())
    }
}

/// Entry point: build the consumer and store from configuration and run
/// until SIGTERM, with the rollup/retention schedule alongside.
pub async fn run(config: BeaconConfig) -> Result<()> {
    match config.bus.kind {
        BusKind::Memory => {
            warn!("memory bus selected: a standalone worker sees only records published in-process");
            let store = Arc::new(
                Store::from_config(&config.storage, &config.retention)
                    .map_err(|e| anyhow::anyhow!("store init: {e}"))?,
            );
            let consumer =
                MemoryBus::new(config.bus.partitions).consumer(&config.worker.consumer_group);
            serve(config, consumer, store, shutdown_signal()).await
        }
        BusKind::Kafka => run_kafka(config).await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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

/// Run a worker plus the maintenance schedule with injected collaborators.
pub async fn serve(
    config: BeaconConfig,
    consumer: impl BusConsumer + 'static,
    store: Arc<Store>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let worker = Worker::new(consumer, Arc::clone(&store), config.worker.clone());
    let maintenance = tokio::spawn(run_maintenance(
        Arc::clone(&store),
        config.worker.rollup_interval_s,
    ));
    let result = worker.run(shutdown).await;
    maintenance.abort();
    result
}

/// Kafka variant of `run`.
#[cfg(feature = "kafka")]
async fn run_kafka(config: BeaconConfig) -> Result<()> {
    let store = Arc::new(
        Store::from_config(&config.storage, &config.retention)
            .map_err(|e| anyhow::anyhow!("store init: {e}"))?,
    );
    let consumer = beacon_bus::KafkaBusConsumer::new(
        &config.bus.brokers,
        &config.bus.topic,
        &config.worker.consumer_group,
    )
    .map_err(|e| anyhow::anyhow!("kafka consumer init: {e}"))?;
    serve(config, consumer, store, shutdown_signal()).await
}

#[cfg(not(feature = "kafka"))]
async fn run_kafka(_config: BeaconConfig) -> Result<()> {
    anyhow::bail!("bus.kind = kafka but this binary was built without the kafka feature")
}
