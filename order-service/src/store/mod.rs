//! Durable store for orders, inventory, payments and the processed-events
//! ledger.
//!
//! [`Store`] is the seam between the business logic and the backing engine:
//! [`postgres::PgStore`] is the production implementation,
//! [`memory::MemoryStore`] backs tests that need no running database.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Inventory, NewOrder, NewOrderItem, NewOutboxEvent, NewPayment, Order, OrderItem, OrderStatus,
    OutboxEvent, Payment, PaymentStatus, Product,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("insufficient stock for product {product_id}: available={available}, requested={requested}")]
    InsufficientStock {
        product_id: i64,
        available: i32,
        requested: i32,
    },

    #[error("idempotency key already in use")]
    DuplicateKey,

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error(transparent)]
    Database(#[from] diesel::result::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
    // Catalog (read-only to this service).
    async fn product_by_id(&self, id: i64) -> Result<Option<Product>, StoreError>;
    async fn products_by_ids(&self, ids: &[i64]) -> Result<Vec<Product>, StoreError>;
    async fn products(&self) -> Result<Vec<Product>, StoreError>;

    // Inventory. The store is the authoritative durable record; the stock
    // cache in front of it is reconciled back to these rows.
    async fn inventory(&self, product_id: i64) -> Result<Option<Inventory>, StoreError>;

    /// Row-locked reserve: fails with [`StoreError::InsufficientStock`]
    /// instead of ever driving `available` negative.
    async fn reserve_stock_tx(&self, product_id: i64, quantity: i32) -> Result<(), StoreError>;

    /// Compensating release: `available += q`, `reserved -= q`.
    /// Returns whether a row was updated.
    async fn release_stock(&self, product_id: i64, quantity: i32) -> Result<bool, StoreError>;

    /// Final deduction: `reserved -= q`. Returns whether a row was updated.
    async fn commit_stock(&self, product_id: i64, quantity: i32) -> Result<bool, StoreError>;

    // Orders.
    async fn create_order(&self, order: NewOrder) -> Result<Order, StoreError>;
    async fn order_by_id(&self, id: i64) -> Result<Option<Order>, StoreError>;
    async fn order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, StoreError>;
    async fn orders_for_user(&self, user_id: i64) -> Result<Vec<Order>, StoreError>;

    /// Guarded status transition: only applies when the row is still in
    /// `from`. Returns whether the transition was applied.
    async fn update_order_status(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, StoreError>;

    /// Guarded status transition plus an outbox insert, in one transaction.
    /// The outbox row is only written when the transition applies.
    async fn transition_with_outbox(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
        event: NewOutboxEvent,
    ) -> Result<bool, StoreError>;

    // Order items.
    async fn create_order_item(&self, item: NewOrderItem) -> Result<OrderItem, StoreError>;
    async fn order_items(&self, order_id: i64) -> Result<Vec<OrderItem>, StoreError>;

    // Payments.
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment, StoreError>;
    async fn update_payment_status(
        &self,
        payment_id: i64,
        status: PaymentStatus,
        provider_tx_id: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn payment_for_order(&self, order_id: i64) -> Result<Option<Payment>, StoreError>;

    // Processed-events ledger.
    async fn is_event_processed(&self, event_id: Uuid) -> Result<bool, StoreError>;

    /// Conflict-do-nothing insert so concurrent duplicate deliveries
    /// race benignly.
    async fn mark_event_processed(&self, event_id: Uuid, event_type: &str)
        -> Result<(), StoreError>;

    // Transactional outbox.
    async fn unpublished_outbox(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError>;
    async fn mark_outbox_published(&self, outbox_id: i64) -> Result<(), StoreError>;
}
