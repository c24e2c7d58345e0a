// Kafka adapter (feature `kafka`).
//
// Thin mapping of the bus contract onto rdkafka: keyed produce with delivery
// acknowledgement, a stream consumer with explicit offset commits, and
// watermark-based lag. Reconnection and rebalancing stay inside librdkafka.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::warn;

use crate::{BusConsumer, BusError, BusProducer, BusRecord};

const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

fn classify(error: &KafkaError) -> BusError {
    let code = error.rdkafka_error_code();
    let fatal = matches!(
        code,
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
                | RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::InvalidMessage
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
        )
    );
    if fatal {
        BusError::fatal(error.to_string())
    } else {
        BusError::retryable(error.to_string())
    }
}

pub struct KafkaBusProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaBusProducer {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, BusError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BusError::fatal(format!("producer create failed: {e}")))?;
        Ok(Self {
            producer,
            topic: topic.to_owned(),
        })
    }
}

#[async_trait]
impl BusProducer for KafkaBusProducer {
    async fn publish(&self, key: &str, payload: Bytes) -> Result<(), BusError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload.as_ref());
        self.producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
            .map(|_| ())
            .map_err(|(error, _message)| classify(&error))
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.producer
            .flush(Timeout::After(Duration::from_secs(5)))
            .map_err(|e| classify(&e))
    }

    async fn healthy(&self) -> bool {
        self.producer
            .client()
            .fetch_metadata(Some(&self.topic), METADATA_TIMEOUT)
            .is_ok()
    }
}

pub struct KafkaBusConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaBusConsumer {
    pub fn new(brokers: &str, topic: &str, group: &str) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BusError::fatal(format!("consumer create failed: {e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| classify(&e))?;
        Ok(Self {
            consumer,
            topic: topic.to_owned(),
        })
    }
}

#[async_trait]
impl BusConsumer for KafkaBusConsumer {
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<BusRecord>, BusError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < max {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_elapsed) => break,
                Ok(Err(e)) => {
                    if out.is_empty() {
                        return Err(classify(&e));
                    }
                    warn!(error = %e, "kafka poll error after partial batch");
                    break;
                }
                Ok(Ok(message)) => {
                    out.push(BusRecord {
                        partition: message.partition(),
                        offset: message.offset(),
                        payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn commit(&mut self, offsets: &[(i32, i64)]) -> Result<(), BusError> {
        let mut list = TopicPartitionList::new();
        for &(partition, offset) in offsets {
            list.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| classify(&e))?;
        }
        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(|e| classify(&e))
    }

    async fn lag(&self) -> Result<u64, BusError> {
        let assignment = self.consumer.assignment().map_err(|e| classify(&e))?;
        let committed = self
            .consumer
            .committed(METADATA_TIMEOUT)
            .map_err(|e| classify(&e))?;
        let mut lag = 0i64;
        for element in assignment.elements() {
            let (_, high) = self
                .consumer
                .fetch_watermarks(element.topic(), element.partition(), METADATA_TIMEOUT)
                .map_err(|e| classify(&e))?;
            let done = committed
                .find_partition(element.topic(), element.partition())
                .and_then(|p| p.offset().to_raw())
                .unwrap_or(0);
            lag += (high - done).max(0);
        }
        Ok(lag as u64)
    }
}
