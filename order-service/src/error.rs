use thiserror::Error;

use crate::models::OrderStatus;
use crate::store::StoreError;

/// Errors surfaced by the order workflow.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid order request: {0}")]
    InvalidInput(String),

    #[error("insufficient stock for product {0}")]
    InsufficientStock(i64),

    #[error("order not found: {0}")]
    NotFound(i64),

    #[error("request cancelled before completion")]
    Cancelled,

    /// The guarded status update found the order in an unexpected state.
    #[error("order {order_id} is no longer in {expected} state")]
    StateConflict { order_id: i64, expected: OrderStatus },

    /// Some per-item stock operations failed while applying a payment
    /// result; the event stays unacknowledged so the broker redelivers it.
    #[error("stock updates incomplete for order {order_id} ({failed} of {total} items failed)")]
    StockIncomplete {
        order_id: i64,
        failed: usize,
        total: usize,
    },

    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
