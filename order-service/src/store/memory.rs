use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::models::{
    Inventory, NewOrder, NewOrderItem, NewOutboxEvent, NewPayment, Order, OrderItem, OrderStatus,
    OutboxEvent, Payment, PaymentStatus, ProcessedEvent, Product,
};

#[derive(Debug, Default)]
struct Inner {
    products: BTreeMap<i64, Product>,
    inventory: BTreeMap<i64, Inventory>,
    orders: BTreeMap<i64, Order>,
    order_items: Vec<OrderItem>,
    payments: Vec<Payment>,
    processed: BTreeMap<Uuid, ProcessedEvent>,
    outbox: Vec<OutboxEvent>,
    product_seq: i64,
    order_seq: i64,
    item_seq: i64,
    payment_seq: i64,
    outbox_seq: i64,
}

/// In-memory store. Single-mutex serialization gives it the same
/// atomicity guarantees the Postgres implementation gets from row locks,
/// which is what the concurrency tests lean on.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog entry together with its inventory row.
    pub fn seed_product(&self, sku: &str, name: &str, price_cents: i64, available: i32) -> Product {
        let mut inner = self.inner.lock().unwrap();
        inner.product_seq += 1;
        let product = Product {
            id: inner.product_seq,
            sku: sku.to_string(),
            name: name.to_string(),
            price_cents,
            created_at: Utc::now(),
        };
        inner.products.insert(product.id, product.clone());
        inner.inventory.insert(
            product.id,
            Inventory {
                product_id: product.id,
                available,
                reserved: 0,
                updated_at: Utc::now(),
            },
        );
        product
    }

    pub fn set_inventory(&self, product_id: i64, available: i32, reserved: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.inventory.insert(
            product_id,
            Inventory {
                product_id,
                available,
                reserved,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn processed_event_count(&self) -> usize {
        self.inner.lock().unwrap().processed.len()
    }

    pub fn outbox_rows(&self) -> Vec<OutboxEvent> {
        self.inner.lock().unwrap().outbox.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn product_by_id(&self, id: i64) -> Result<Option<Product>, StoreError> {
        Ok(self.inner.lock().unwrap().products.get(&id).cloned())
    }

    async fn products_by_ids(&self, ids: &[i64]) -> Result<Vec<Product>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| inner.products.get(id).cloned())
            .collect())
    }

    async fn products(&self) -> Result<Vec<Product>, StoreError> {
        Ok(self.inner.lock().unwrap().products.values().cloned().collect())
    }

    async fn inventory(&self, product_id: i64) -> Result<Option<Inventory>, StoreError> {
        Ok(self.inner.lock().unwrap().inventory.get(&product_id).cloned())
    }

    async fn reserve_stock_tx(&self, product_id: i64, quantity: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .inventory
            .get_mut(&product_id)
            .ok_or(StoreError::Database(diesel::result::Error::NotFound))?;
        if row.available < quantity {
            return Err(StoreError::InsufficientStock {
                product_id,
                available: row.available,
                requested: quantity,
            });
        }
        row.available -= quantity;
        row.reserved += quantity;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn release_stock(&self, product_id: i64, quantity: i32) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.inventory.get_mut(&product_id) {
            Some(row) => {
                row.available += quantity;
                row.reserved -= quantity;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn commit_stock(&self, product_id: i64, quantity: i32) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.inventory.get_mut(&product_id) {
            Some(row) => {
                row.reserved -= quantity;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = &order.idempotency_key {
            if inner
                .orders
                .values()
                .any(|o| o.idempotency_key.as_deref() == Some(key))
            {
                return Err(StoreError::DuplicateKey);
            }
        }
        inner.order_seq += 1;
        let now = Utc::now();
        let created = Order {
            id: inner.order_seq,
            user_id: order.user_id,
            total_cents: order.total_cents,
            status: order.status,
            idempotency_key: order.idempotency_key,
            created_at: now,
            updated_at: now,
        };
        inner.orders.insert(created.id, created.clone());
        Ok(created)
    }

    async fn order_by_id(&self, id: i64) -> Result<Option<Order>, StoreError> {
        Ok(self.inner.lock().unwrap().orders.get(&id).cloned())
    }

    async fn order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .find(|o| o.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn orders_for_user(&self, user_id: i64) -> Result<Vec<Order>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut found: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(found)
    }

    async fn update_order_status(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.orders.get_mut(&order_id) {
            Some(order) if order.status == from.as_str() => {
                order.status = to.as_str().to_string();
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_with_outbox(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
        event: NewOutboxEvent,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.orders.get_mut(&order_id) {
            Some(order) if order.status == from.as_str() => {
                order.status = to.as_str().to_string();
                order.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }
        inner.outbox_seq += 1;
        let row = OutboxEvent {
            id: inner.outbox_seq,
            order_id: event.order_id,
            event_type: event.event_type,
            payload: event.payload,
            published: false,
            created_at: Utc::now(),
        };
        inner.outbox.push(row);
        Ok(true)
    }

    async fn create_order_item(&self, item: NewOrderItem) -> Result<OrderItem, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.item_seq += 1;
        let created = OrderItem {
            id: inner.item_seq,
            order_id: item.order_id,
            product_id: item.product_id,
            quantity: item.quantity,
            unit_price_cents: item.unit_price_cents,
        };
        inner.order_items.push(created.clone());
        Ok(created)
    }

    async fn order_items(&self, order_id: i64) -> Result<Vec<OrderItem>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn create_payment(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.payment_seq += 1;
        let now = Utc::now();
        let created = Payment {
            id: inner.payment_seq,
            order_id: payment.order_id,
            status: payment.status,
            provider_tx_id: payment.provider_tx_id,
            amount_cents: payment.amount_cents,
            created_at: now,
            updated_at: now,
        };
        inner.payments.push(created.clone());
        Ok(created)
    }

    async fn update_payment_status(
        &self,
        payment_id: i64,
        status: PaymentStatus,
        provider_tx_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(payment) = inner.payments.iter_mut().find(|p| p.id == payment_id) {
            payment.status = status.as_str().to_string();
            payment.provider_tx_id = provider_tx_id.map(str::to_string);
            payment.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn payment_for_order(&self, order_id: i64) -> Result<Option<Payment>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .payments
            .iter()
            .filter(|p| p.order_id == order_id)
            .last()
            .cloned())
    }

    async fn is_event_processed(&self, event_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().processed.contains_key(&event_id))
    }

    async fn mark_event_processed(
        &self,
        event_id: Uuid,
        event_type: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.processed.entry(event_id).or_insert_with(|| ProcessedEvent {
            event_id,
            event_type: event_type.to_string(),
            processed_at: Utc::now(),
        });
        Ok(())
    }

    async fn unpublished_outbox(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .outbox
            .iter()
            .filter(|e| !e.published)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_outbox_published(&self, outbox_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.outbox.iter_mut().find(|e| e.id == outbox_id) {
            row.published = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_refuses_to_oversell() {
        let store = MemoryStore::new();
        let product = store.seed_product("SKU-1", "Widget", 1_000, 3);

        store.reserve_stock_tx(product.id, 2).await.unwrap();
        let err = store.reserve_stock_tx(product.id, 2).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientStock { available: 1, requested: 2, .. }
        ));

        let row = store.inventory(product.id).await.unwrap().unwrap();
        assert_eq!((row.available, row.reserved), (1, 2));
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let store = MemoryStore::new();
        let order = NewOrder {
            user_id: 1,
            total_cents: 500,
            status: OrderStatus::Created.as_str().to_string(),
            idempotency_key: Some("k1".into()),
        };
        store.create_order(order.clone()).await.unwrap();
        let err = store.create_order(order).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey));
    }

    #[tokio::test]
    async fn guarded_update_only_applies_from_expected_state() {
        let store = MemoryStore::new();
        let order = store
            .create_order(NewOrder {
                user_id: 1,
                total_cents: 500,
                status: OrderStatus::Created.as_str().to_string(),
                idempotency_key: None,
            })
            .await
            .unwrap();

        assert!(store
            .update_order_status(order.id, OrderStatus::Created, OrderStatus::Reserved)
            .await
            .unwrap());
        // Replaying the same transition finds the guard unmatched.
        assert!(!store
            .update_order_status(order.id, OrderStatus::Created, OrderStatus::Reserved)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn event_ledger_insert_is_conflict_free() {
        let store = MemoryStore::new();
        let event_id = Uuid::new_v4();

        assert!(!store.is_event_processed(event_id).await.unwrap());
        store
            .mark_event_processed(event_id, "PAYMENT_SUCCESS")
            .await
            .unwrap();
        store
            .mark_event_processed(event_id, "PAYMENT_SUCCESS")
            .await
            .unwrap();
        assert!(store.is_event_processed(event_id).await.unwrap());
        assert_eq!(store.processed_event_count(), 1);
    }

    #[tokio::test]
    async fn user_orders_come_back_newest_first() {
        let store = MemoryStore::new();
        let product = store.seed_product("SKU-1", "Widget", 1_000, 10);
        assert_eq!(
            store.product_by_id(product.id).await.unwrap().unwrap().sku,
            "SKU-1"
        );

        for total in [100, 200, 300] {
            store
                .create_order(NewOrder {
                    user_id: 42,
                    total_cents: total,
                    status: OrderStatus::Created.as_str().to_string(),
                    idempotency_key: None,
                })
                .await
                .unwrap();
        }

        let orders = store.orders_for_user(42).await.unwrap();
        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0].total_cents, 300);
        assert!(store.orders_for_user(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transition_with_outbox_skips_outbox_when_guard_misses() {
        let store = MemoryStore::new();
        let order = store
            .create_order(NewOrder {
                user_id: 1,
                total_cents: 500,
                status: OrderStatus::Created.as_str().to_string(),
                idempotency_key: None,
            })
            .await
            .unwrap();

        let event = NewOutboxEvent {
            order_id: order.id,
            event_type: "ORDER_RESERVED".into(),
            payload: serde_json::json!({"order_id": order.id}),
        };
        assert!(store
            .transition_with_outbox(order.id, OrderStatus::Created, OrderStatus::Reserved, event.clone())
            .await
            .unwrap());
        assert!(!store
            .transition_with_outbox(order.id, OrderStatus::Created, OrderStatus::Reserved, event)
            .await
            .unwrap());
        assert_eq!(store.outbox_rows().len(), 1);
    }
}
