//! Asynchronous half of the saga: applying payment results to orders and
//! inventory with exactly-once effects.
//!
//! The processed-events ledger is the commit point. A handler only marks
//! an event processed after every per-item stock call has been attempted
//! and the status transitions have landed; until then the offset stays
//! uncommitted and the broker redelivers.

use std::sync::Arc;

use futures::StreamExt;
use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shared::{
    EventHeader, EventType, OrderCancelledEvent, OrderConfirmedEvent, PaymentFailedEvent,
    PaymentSuccessEvent,
};

use crate::broker::EventPublisher;
use crate::error::OrderError;
use crate::inventory::InventoryService;
use crate::models::OrderStatus;
use crate::store::Store;

pub struct SagaOrchestrator {
    store: Arc<dyn Store>,
    inventory: Arc<InventoryService>,
    events: Arc<EventPublisher>,
}

impl SagaOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        inventory: Arc<InventoryService>,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            store,
            inventory,
            events,
        }
    }

    pub async fn on_payment_success(&self, event: &PaymentSuccessEvent) -> Result<(), OrderError> {
        if self.store.is_event_processed(event.header.event_id).await? {
            counter!("events_duplicate_total").increment(1);
            info!(event_id = %event.header.event_id, "event already processed");
            return Ok(());
        }

        info!(
            order_id = event.order_id,
            tx_id = %event.tx_id,
            "handling payment success"
        );

        self.advance(
            event.order_id,
            OrderStatus::Reserved,
            OrderStatus::Paid,
            &[OrderStatus::Confirmed],
        )
        .await?;
        counter!("orders_paid_total").increment(1);

        let items = self.store.order_items(event.order_id).await?;
        let mut failed = 0;
        for item in &items {
            if let Err(err) = self.inventory.commit(item.product_id, item.quantity).await {
                error!(
                    order_id = event.order_id,
                    product_id = item.product_id,
                    %err,
                    "failed to commit stock"
                );
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(OrderError::StockIncomplete {
                order_id: event.order_id,
                failed,
                total: items.len(),
            });
        }

        self.advance(event.order_id, OrderStatus::Paid, OrderStatus::Confirmed, &[])
            .await?;

        self.store
            .mark_event_processed(event.header.event_id, event.header.event_type.as_str())
            .await?;

        let confirmed = OrderConfirmedEvent::new(event.order_id);
        if let Err(err) = self.events.order_confirmed(&confirmed).await {
            error!(order_id = event.order_id, %err, "failed to publish order-confirmed event");
        }

        counter!("orders_confirmed_total").increment(1);
        info!(order_id = event.order_id, "order confirmed");
        Ok(())
    }

    pub async fn on_payment_failed(&self, event: &PaymentFailedEvent) -> Result<(), OrderError> {
        if self.store.is_event_processed(event.header.event_id).await? {
            counter!("events_duplicate_total").increment(1);
            info!(event_id = %event.header.event_id, "event already processed");
            return Ok(());
        }

        warn!(
            order_id = event.order_id,
            reason = %event.reason,
            "handling payment failure, compensating reservation"
        );

        let items = self.store.order_items(event.order_id).await?;
        let mut failed = 0;
        for item in &items {
            if let Err(err) = self.inventory.release(item.product_id, item.quantity).await {
                error!(
                    order_id = event.order_id,
                    product_id = item.product_id,
                    %err,
                    "failed to release stock during compensation"
                );
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(OrderError::StockIncomplete {
                order_id: event.order_id,
                failed,
                total: items.len(),
            });
        }

        self.advance(
            event.order_id,
            OrderStatus::Reserved,
            OrderStatus::Cancelled,
            &[],
        )
        .await?;

        self.store
            .mark_event_processed(event.header.event_id, event.header.event_type.as_str())
            .await?;

        let cancelled = OrderCancelledEvent::new(event.order_id, event.reason.clone());
        if let Err(err) = self.events.order_cancelled(&cancelled).await {
            error!(order_id = event.order_id, %err, "failed to publish order-cancelled event");
        }

        counter!("orders_cancelled_total").increment(1);
        info!(order_id = event.order_id, "order cancelled and compensated");
        Ok(())
    }

    /// Guarded transition that tolerates crash-replay: an unmatched guard
    /// is fine when the order already sits at the target (or further along
    /// the same path), and an error otherwise so the event is redelivered.
    async fn advance(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
        also_done: &[OrderStatus],
    ) -> Result<(), OrderError> {
        if self.store.update_order_status(order_id, from, to).await? {
            return Ok(());
        }
        let order = self
            .store
            .order_by_id(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        match order.status() {
            Some(current) if current == to || also_done.contains(&current) => {
                info!(order_id, status = %current, "transition already applied");
                Ok(())
            }
            _ => Err(OrderError::StateConflict {
                order_id,
                expected: from,
            }),
        }
    }

    /// Consumer loop for payment-result events. The offset is committed
    /// only after the handler returns success; the in-flight handler is
    /// always allowed to finish on shutdown.
    pub async fn run(&self, consumer: StreamConsumer, shutdown: CancellationToken) {
        let mut stream = consumer.stream();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("saga consumer shutting down");
                    break;
                }
                message = stream.next() => {
                    let Some(message) = message else { break };
                    match message {
                        Ok(m) => {
                            match self.handle_message(&m).await {
                                Ok(()) => {
                                    if let Err(err) = consumer.commit_message(&m, CommitMode::Async) {
                                        error!(%err, "failed to commit offset");
                                    }
                                }
                                Err(err) => {
                                    // Left uncommitted on purpose: the broker
                                    // will redeliver and the ledger keeps the
                                    // retry idempotent.
                                    error!(%err, "payment event handling failed");
                                }
                            }
                        }
                        Err(err) => error!(%err, "kafka receive error"),
                    }
                }
            }
        }
    }

    async fn handle_message(&self, message: &BorrowedMessage<'_>) -> Result<(), OrderError> {
        let Some(Ok(payload)) = message.payload_view::<str>() else {
            warn!("skipping message without utf-8 payload");
            return Ok(());
        };
        let header: EventHeader = match serde_json::from_str(payload) {
            Ok(header) => header,
            Err(err) => {
                warn!(%err, "skipping undecodable event");
                return Ok(());
            }
        };
        match header.event_type {
            EventType::PaymentSuccess => match serde_json::from_str::<PaymentSuccessEvent>(payload)
            {
                Ok(event) => self.on_payment_success(&event).await,
                Err(err) => {
                    warn!(%err, "skipping malformed payment-success event");
                    Ok(())
                }
            },
            EventType::PaymentFailed => match serde_json::from_str::<PaymentFailedEvent>(payload) {
                Ok(event) => self.on_payment_failed(&event).await,
                Err(err) => {
                    warn!(%err, "skipping malformed payment-failed event");
                    Ok(())
                }
            },
            // Order lifecycle events on the same topic are not ours to handle.
            _ => Ok(()),
        }
    }
}
