use std::fmt;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order lifecycle states. Persisted as the upper-case string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Reserved,
    Paid,
    Confirmed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Reserved => "RESERVED",
            OrderStatus::Paid => "PAID",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(OrderStatus::Created),
            "RESERVED" => Some(OrderStatus::Reserved),
            "PAID" => Some(OrderStatus::Paid),
            "CONFIRMED" => Some(OrderStatus::Confirmed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Legal transitions:
    ///
    /// ```text
    /// CREATED  -> RESERVED | FAILED
    /// RESERVED -> PAID | CANCELLED
    /// PAID     -> CONFIRMED
    /// ```
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Created, OrderStatus::Reserved)
                | (OrderStatus::Created, OrderStatus::Failed)
                | (OrderStatus::Reserved, OrderStatus::Paid)
                | (OrderStatus::Reserved, OrderStatus::Cancelled)
                | (OrderStatus::Paid, OrderStatus::Confirmed)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry. Created out-of-band; read-only to this service.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory)]
pub struct Inventory {
    pub product_id: i64,
    pub available: i32,
    pub reserved: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub total_cents: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub user_id: i64,
    pub total_cents: i64,
    pub status: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct NewOrderItem {
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::payments)]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_tx_id: Option<String>,
    pub amount_cents: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct NewPayment {
    pub order_id: i64,
    pub status: String,
    pub provider_tx_id: Option<String>,
    pub amount_cents: i64,
}

/// Ledger row recording that an event's effects have been applied.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::processed_events)]
pub struct ProcessedEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct OutboxEvent {
    pub id: i64,
    pub order_id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub published: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub order_id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        assert!(OrderStatus::Created.can_transition_to(OrderStatus::Reserved));
        assert!(OrderStatus::Reserved.can_transition_to(OrderStatus::Paid));
        assert!(OrderStatus::Paid.can_transition_to(OrderStatus::Confirmed));
    }

    #[test]
    fn compensation_transitions_are_legal() {
        assert!(OrderStatus::Created.can_transition_to(OrderStatus::Failed));
        assert!(OrderStatus::Reserved.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn terminal_states_accept_no_transitions() {
        for terminal in [
            OrderStatus::Confirmed,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                OrderStatus::Created,
                OrderStatus::Reserved,
                OrderStatus::Paid,
                OrderStatus::Confirmed,
                OrderStatus::Cancelled,
                OrderStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn replays_are_not_transitions() {
        assert!(!OrderStatus::Confirmed.can_transition_to(OrderStatus::Paid));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Paid));
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            OrderStatus::Created,
            OrderStatus::Reserved,
            OrderStatus::Paid,
            OrderStatus::Confirmed,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("SHIPPED"), None);
    }
}
