//! In-process mock payment provider.
//!
//! Consumes `OrderReserved` on its own consumer group, records a payment
//! row, simulates a provider decision and publishes the result event.
//! This stands in for the external payment processor; the saga only ever
//! sees the events it emits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::{
    EventHeader, EventType, OrderReservedEvent, PaymentFailedEvent, PaymentSuccessEvent,
};

use crate::broker::EventPublisher;
use crate::models::{NewPayment, PaymentStatus};
use crate::store::Store;

const DEFAULT_SUCCESS_RATE: f64 = 0.9;

pub struct PaymentWorker {
    store: Arc<dyn Store>,
    events: Arc<EventPublisher>,
    success_rate: f64,
    budget: Duration,
}

impl PaymentWorker {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventPublisher>, budget: Duration) -> Self {
        Self {
            store,
            events,
            success_rate: DEFAULT_SUCCESS_RATE,
            budget,
        }
    }

    /// Forces a deterministic outcome; used by tests.
    pub fn with_success_rate(mut self, rate: f64) -> Self {
        self.success_rate = rate;
        self
    }

    pub async fn run(&self, consumer: StreamConsumer, shutdown: CancellationToken) {
        let mut stream = consumer.stream();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("payment worker shutting down");
                    break;
                }
                message = stream.next() => {
                    let Some(message) = message else { break };
                    match message {
                        Ok(m) => {
                            if let Some(Ok(payload)) = m.payload_view::<str>() {
                                if let Err(err) = self.handle_payload(payload).await {
                                    error!(%err, "payment processing failed");
                                    continue;
                                }
                            }
                            if let Err(err) = consumer.commit_message(&m, CommitMode::Async) {
                                error!(%err, "failed to commit offset");
                            }
                        }
                        Err(err) => error!(%err, "kafka receive error"),
                    }
                }
            }
        }
    }

    async fn handle_payload(&self, payload: &str) -> Result<()> {
        let header: EventHeader = match serde_json::from_str(payload) {
            Ok(header) => header,
            Err(err) => {
                warn!(%err, "skipping undecodable event");
                return Ok(());
            }
        };
        if header.event_type != EventType::OrderReserved {
            return Ok(());
        }
        let event: OrderReservedEvent = serde_json::from_str(payload)?;

        match tokio::time::timeout(
            self.budget,
            self.process_payment(event.order_id, event.total_cents),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(order_id = event.order_id, "payment processing timed out");
                Ok(())
            }
        }
    }

    pub async fn process_payment(&self, order_id: i64, amount_cents: i64) -> Result<()> {
        counter!("payments_attempted_total").increment(1);
        info!(order_id, amount_cents, "processing payment");

        let payment = self
            .store
            .create_payment(NewPayment {
                order_id,
                status: PaymentStatus::Pending.as_str().to_string(),
                provider_tx_id: None,
                amount_cents,
            })
            .await?;

        // Simulated provider latency.
        tokio::time::sleep(Duration::from_millis(100 + rand::random::<u64>() % 400)).await;

        let approved = rand::random::<f64>() < self.success_rate;

        if approved {
            let tx_id = format!("TXN-{}", &Uuid::new_v4().simple().to_string()[..8]);
            self.store
                .update_payment_status(payment.id, PaymentStatus::Success, Some(&tx_id))
                .await?;
            counter!("payments_success_total").increment(1);
            info!(order_id, %tx_id, "payment succeeded");

            let event = PaymentSuccessEvent::new(order_id, payment.id, amount_cents, tx_id);
            if let Err(err) = self.events.payment_success(&event).await {
                error!(order_id, %err, "failed to publish payment-success event");
            }
        } else {
            self.store
                .update_payment_status(payment.id, PaymentStatus::Failed, None)
                .await?;
            counter!("payments_failed_total").increment(1);
            warn!(order_id, "payment declined");

            let event = PaymentFailedEvent::new(order_id, payment.id, "mock_payment_declined");
            if let Err(err) = self.events.payment_failed(&event).await {
                error!(order_id, %err, "failed to publish payment-failed event");
            }
        }

        Ok(())
    }
}
