//! Order submission: validation, pricing, persistence, reservation and
//! the synchronous half of the saga.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use shared::{OrderCreatedEvent, OrderItemData, OrderReservedEvent};

use crate::error::OrderError;
use crate::inventory::InventoryService;
use crate::broker::EventPublisher;
use crate::models::{NewOrder, NewOrderItem, NewOutboxEvent, Order, OrderItem, OrderStatus, Product};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: i64,
    pub items: Vec<OrderItemRequest>,
    pub payment_method: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderItemRequest {
    pub product_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_id: i64,
    pub status: String,
}

pub struct OrderService {
    store: Arc<dyn Store>,
    inventory: Arc<InventoryService>,
    events: Arc<EventPublisher>,
}

impl OrderService {
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

    /// Drives a new order to RESERVED, or compensates and fails it.
    ///
    /// The idempotency key is the sole identity of a submission: a
    /// duplicate returns the existing order untouched, whether detected by
    /// the initial lookup or by losing the unique-constraint race.
    pub async fn submit_order(
        &self,
        mut request: CreateOrderRequest,
        cancel: CancellationToken,
    ) -> Result<CreateOrderResponse, OrderError> {
        validate(&request)?;

        let key = request
            .idempotency_key
            .take()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = self.store.order_by_idempotency_key(&key).await? {
            info!(
                order_id = existing.id,
                idempotency_key = %key,
                "duplicate order request detected"
            );
            return Ok(existing_response(existing));
        }

        let products = self.validate_items(&request.items).await?;
        let total_cents = order_total_cents(&request.items, &products);

        let order = match self
            .store
            .create_order(NewOrder {
                user_id: request.user_id,
                total_cents,
                status: OrderStatus::Created.as_str().to_string(),
                idempotency_key: Some(key.clone()),
            })
            .await
        {
            Ok(order) => order,
            Err(StoreError::DuplicateKey) => {
                // A concurrent submission with the same key won the insert.
                let existing = self
                    .store
                    .order_by_idempotency_key(&key)
                    .await?
                    .ok_or(StoreError::DuplicateKey)?;
                return Ok(existing_response(existing));
            }
            Err(err) => return Err(err.into()),
        };

        counter!("orders_created_total").increment(1);
        info!(order_id = order.id, total_cents, "order created");

        let mut item_data = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = &products[&item.product_id];
            self.store
                .create_order_item(NewOrderItem {
                    order_id: order.id,
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price_cents: product.price_cents,
                })
                .await?;
            item_data.push(OrderItemData {
                product_id: item.product_id,
                quantity: item.quantity,
                unit_price_cents: product.price_cents,
            });
        }

        let created_event =
            OrderCreatedEvent::new(order.id, order.user_id, total_cents, item_data.clone());
        if let Err(err) = self.events.order_created(&created_event).await {
            error!(order_id = order.id, %err, "failed to publish order-created event");
        }

        if let Err(failure) = self.reserve_items(order.id, &request.items, &cancel).await {
            if let Err(err) = self
                .store
                .update_order_status(order.id, OrderStatus::Created, OrderStatus::Failed)
                .await
            {
                error!(order_id = order.id, %err, "failed to mark order failed");
            }
            counter!("orders_failed_total").increment(1);
            return Err(failure);
        }

        // The status flip and the reserved-event publication must not come
        // apart: losing this event would strand the order in RESERVED, so
        // it goes through the transactional outbox.
        let reserved_event =
            OrderReservedEvent::new(order.id, order.user_id, total_cents, item_data);
        let flipped = self
            .store
            .transition_with_outbox(
                order.id,
                OrderStatus::Created,
                OrderStatus::Reserved,
                NewOutboxEvent {
                    order_id: order.id,
                    event_type: reserved_event.header.event_type.as_str().to_string(),
                    payload: serde_json::to_value(&reserved_event)?,
                },
            )
            .await?;
        if !flipped {
            return Err(OrderError::StateConflict {
                order_id: order.id,
                expected: OrderStatus::Created,
            });
        }

        counter!("orders_reserved_total").increment(1);
        info!(order_id = order.id, "order reserved");

        Ok(CreateOrderResponse {
            order_id: order.id,
            status: OrderStatus::Reserved.as_str().to_string(),
        })
    }

    pub async fn get_order(&self, order_id: i64) -> Result<(Order, Vec<OrderItem>), OrderError> {
        let order = self
            .store
            .order_by_id(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        let items = self.store.order_items(order_id).await?;
        Ok((order, items))
    }

    async fn validate_items(
        &self,
        items: &[OrderItemRequest],
    ) -> Result<HashMap<i64, Product>, OrderError> {
        let ids: Vec<i64> = items
            .iter()
            .map(|i| i.product_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let found = self.store.products_by_ids(&ids).await?;
        let by_id: HashMap<i64, Product> = found.into_iter().map(|p| (p.id, p)).collect();
        for id in &ids {
            if !by_id.contains_key(id) {
                return Err(OrderError::InvalidInput(format!("product not found: {}", id)));
            }
        }
        Ok(by_id)
    }

    /// Reserves every item in request order, rolling back on the first
    /// denial, error or cancellation. Only items actually reserved in this
    /// saga are compensated, newest first.
    async fn reserve_items(
        &self,
        order_id: i64,
        items: &[OrderItemRequest],
        cancel: &CancellationToken,
    ) -> Result<(), OrderError> {
        let start = Instant::now();
        let mut reserved: Vec<&OrderItemRequest> = Vec::with_capacity(items.len());

        for item in items {
            if cancel.is_cancelled() {
                self.rollback_reservations(order_id, &reserved).await;
                return Err(OrderError::Cancelled);
            }
            match self.inventory.reserve(item.product_id, item.quantity).await {
                Ok(true) => reserved.push(item),
                Ok(false) => {
                    counter!("inventory_reservations_denied_total").increment(1);
                    self.rollback_reservations(order_id, &reserved).await;
                    return Err(OrderError::InsufficientStock(item.product_id));
                }
                Err(err) => {
                    self.rollback_reservations(order_id, &reserved).await;
                    return Err(err.into());
                }
            }
        }

        histogram!("inventory_reserve_seconds").record(start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn rollback_reservations(&self, order_id: i64, reserved: &[&OrderItemRequest]) {
        for item in reserved.iter().rev() {
            if let Err(err) = self.inventory.release(item.product_id, item.quantity).await {
                error!(
                    order_id,
                    product_id = item.product_id,
                    %err,
                    "failed to roll back reservation"
                );
            }
        }
    }
}

fn existing_response(order: Order) -> CreateOrderResponse {
    CreateOrderResponse {
        order_id: order.id,
        status: order.status,
    }
}

fn validate(request: &CreateOrderRequest) -> Result<(), OrderError> {
    if request.user_id < 1 {
        return Err(OrderError::InvalidInput("user_id must be positive".into()));
    }
    if request.items.is_empty() {
        return Err(OrderError::InvalidInput(
            "order must contain at least one item".into(),
        ));
    }
    if request.items.iter().any(|i| i.quantity < 1) {
        return Err(OrderError::InvalidInput(
            "item quantity must be at least 1".into(),
        ));
    }
    if request.payment_method.is_empty() {
        return Err(OrderError::InvalidInput("payment_method is required".into()));
    }
    Ok(())
}

/// Prices are snapshotted at submission time.
fn order_total_cents(items: &[OrderItemRequest], products: &HashMap<i64, Product>) -> i64 {
    items
        .iter()
        .map(|item| products[&item.product_id].price_cents * i64::from(item.quantity))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn product(id: i64, price_cents: i64) -> Product {
        Product {
            id,
            sku: format!("SKU-{}", id),
            name: format!("Product {}", id),
            price_cents,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn total_sums_price_times_quantity() {
        let items = vec![
            OrderItemRequest { product_id: 1, quantity: 2 },
            OrderItemRequest { product_id: 2, quantity: 1 },
        ];
        let products: HashMap<i64, Product> =
            [(1, product(1, 1_000)), (2, product(2, 500))].into_iter().collect();

        assert_eq!(order_total_cents(&items, &products), 2_500);
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let valid = CreateOrderRequest {
            user_id: 100,
            items: vec![OrderItemRequest { product_id: 1, quantity: 1 }],
            payment_method: "mock".into(),
            idempotency_key: None,
        };
        assert!(validate(&valid).is_ok());

        let mut no_items = valid.clone();
        no_items.items.clear();
        assert!(matches!(validate(&no_items), Err(OrderError::InvalidInput(_))));

        let mut zero_qty = valid.clone();
        zero_qty.items[0].quantity = 0;
        assert!(matches!(validate(&zero_qty), Err(OrderError::InvalidInput(_))));

        let mut bad_user = valid.clone();
        bad_user.user_id = 0;
        assert!(matches!(validate(&bad_user), Err(OrderError::InvalidInput(_))));

        let mut no_method = valid;
        no_method.payment_method.clear();
        assert!(matches!(validate(&no_method), Err(OrderError::InvalidInput(_))));
    }
}
