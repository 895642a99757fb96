//! Event transport: publishing keyed domain events and building the
//! Kafka clients for the consumer loops.
//!
//! Publishing goes through the [`EventSink`] seam so tests can capture
//! events in memory; consuming stays on concrete `rdkafka` stream
//! consumers, with offsets committed only after the handler succeeds.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use thiserror::Error;
use shared::{
    order_key, OrderCancelledEvent, OrderConfirmedEvent, OrderCreatedEvent, OrderReservedEvent,
    PaymentFailedEvent, PaymentSuccessEvent,
};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("kafka publish failed: {0}")]
    Kafka(String),

    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Durable best-effort write; returns after broker acknowledgement.
    async fn publish(&self, key: &str, payload: String) -> Result<(), PublishError>;
}

pub struct KafkaEventSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventSink {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    async fn publish(&self, key: &str, payload: String) -> Result<(), PublishError> {
        let record = FutureRecord::to(&self.topic).payload(&payload).key(key);
        self.producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map_err(|(err, _)| PublishError::Kafka(err.to_string()))?;
        Ok(())
    }
}

/// Captures published events for assertions in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    messages: Arc<RwLock<Vec<(String, String)>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.read().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, key: &str, payload: String) -> Result<(), PublishError> {
        self.messages
            .write()
            .unwrap()
            .push((key.to_string(), payload));
        Ok(())
    }
}

/// Typed publishing facade over a sink: serializes each event and keys it
/// by order so the broker preserves per-order ordering.
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    async fn publish<E: Serialize>(&self, order_id: i64, event: &E) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        self.sink.publish(&order_key(order_id), payload).await
    }

    pub async fn order_created(&self, event: &OrderCreatedEvent) -> Result<(), PublishError> {
        self.publish(event.order_id, event).await
    }

    pub async fn order_reserved(&self, event: &OrderReservedEvent) -> Result<(), PublishError> {
        self.publish(event.order_id, event).await
    }

    pub async fn order_confirmed(&self, event: &OrderConfirmedEvent) -> Result<(), PublishError> {
        self.publish(event.order_id, event).await
    }

    pub async fn order_cancelled(&self, event: &OrderCancelledEvent) -> Result<(), PublishError> {
        self.publish(event.order_id, event).await
    }

    pub async fn payment_success(&self, event: &PaymentSuccessEvent) -> Result<(), PublishError> {
        self.publish(event.order_id, event).await
    }

    pub async fn payment_failed(&self, event: &PaymentFailedEvent) -> Result<(), PublishError> {
        self.publish(event.order_id, event).await
    }

    /// Publishes an already-serialized payload (outbox drain).
    pub async fn raw(&self, key: &str, payload: String) -> Result<(), PublishError> {
        self.sink.publish(key, payload).await
    }
}

pub fn kafka_producer(brokers: &str) -> anyhow::Result<FutureProducer> {
    let producer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "10000")
        .set("acks", "all")
        .create()?;
    Ok(producer)
}

/// Consumer with auto-commit disabled: the loops commit an offset only
/// once the handler has finished, so an interrupted handler is redelivered.
pub fn kafka_consumer(brokers: &str, group: &str, topic: &str) -> anyhow::Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", group)
        .set("bootstrap.servers", brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()?;
    consumer.subscribe(&[topic])?;
    Ok(consumer)
}
