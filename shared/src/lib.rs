//! Domain events exchanged over the order-events topic.
//!
//! Every event is a flat JSON object carrying a common header
//! (`event_id`, `event_type`, `timestamp`) plus type-specific fields.
//! Consumers first decode [`EventHeader`] to route, then decode the
//! concrete event type. Messages are keyed by [`order_key`] so the broker
//! preserves per-order ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "ORDER_CREATED")]
    OrderCreated,
    #[serde(rename = "ORDER_RESERVED")]
    OrderReserved,
    #[serde(rename = "ORDER_CONFIRMED")]
    OrderConfirmed,
    #[serde(rename = "ORDER_CANCELLED")]
    OrderCancelled,
    #[serde(rename = "PAYMENT_SUCCESS")]
    PaymentSuccess,
    #[serde(rename = "PAYMENT_FAILED")]
    PaymentFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "ORDER_CREATED",
            EventType::OrderReserved => "ORDER_RESERVED",
            EventType::OrderConfirmed => "ORDER_CONFIRMED",
            EventType::OrderCancelled => "ORDER_CANCELLED",
            EventType::PaymentSuccess => "PAYMENT_SUCCESS",
            EventType::PaymentFailed => "PAYMENT_FAILED",
        }
    }
}

/// Common fields shared by every event on the topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

impl EventHeader {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
        }
    }
}

/// Partition key for all events belonging to one order.
pub fn order_key(order_id: i64) -> String {
    format!("order-{}", order_id)
}

/// Item snapshot carried inside order events so downstream consumers
/// need no database lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemData {
    pub product_id: i64,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub order_id: i64,
    pub user_id: i64,
    pub total_cents: i64,
    pub items: Vec<OrderItemData>,
}

impl OrderCreatedEvent {
    pub fn new(order_id: i64, user_id: i64, total_cents: i64, items: Vec<OrderItemData>) -> Self {
        Self {
            header: EventHeader::new(EventType::OrderCreated),
            order_id,
            user_id,
            total_cents,
            items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReservedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub order_id: i64,
    pub user_id: i64,
    pub total_cents: i64,
    pub items: Vec<OrderItemData>,
}

impl OrderReservedEvent {
    pub fn new(order_id: i64, user_id: i64, total_cents: i64, items: Vec<OrderItemData>) -> Self {
        Self {
            header: EventHeader::new(EventType::OrderReserved),
            order_id,
            user_id,
            total_cents,
            items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub order_id: i64,
}

impl OrderConfirmedEvent {
    pub fn new(order_id: i64) -> Self {
        Self {
            header: EventHeader::new(EventType::OrderConfirmed),
            order_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub order_id: i64,
    pub reason: String,
}

impl OrderCancelledEvent {
    pub fn new(order_id: i64, reason: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(EventType::OrderCancelled),
            order_id,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSuccessEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub order_id: i64,
    pub payment_id: i64,
    pub amount_cents: i64,
    pub tx_id: String,
}

impl PaymentSuccessEvent {
    pub fn new(order_id: i64, payment_id: i64, amount_cents: i64, tx_id: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(EventType::PaymentSuccess),
            order_id,
            payment_id,
            amount_cents,
            tx_id: tx_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub order_id: i64,
    pub payment_id: i64,
    pub reason: String,
}

impl PaymentFailedEvent {
    pub fn new(order_id: i64, payment_id: i64, reason: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(EventType::PaymentFailed),
            order_id,
            payment_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_routes_any_event_payload() {
        let event = PaymentSuccessEvent::new(42, 7, 3_000_000, "TXN-abc123");
        let json = serde_json::to_string(&event).unwrap();

        let header: EventHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(header.event_type, EventType::PaymentSuccess);
        assert_eq!(header.event_id, event.header.event_id);

        let decoded: PaymentSuccessEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.order_id, 42);
        assert_eq!(decoded.tx_id, "TXN-abc123");
    }

    #[test]
    fn event_type_wire_names_are_screaming_snake() {
        let event = OrderReservedEvent::new(
            1,
            100,
            3_000_000,
            vec![OrderItemData {
                product_id: 1,
                quantity: 2,
                unit_price_cents: 1_500_000,
            }],
        );
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "ORDER_RESERVED");
        assert_eq!(value["items"][0]["unit_price_cents"], 1_500_000);
        assert!(value["event_id"].is_string());
    }

    #[test]
    fn order_key_is_stable_per_order() {
        assert_eq!(order_key(17), "order-17");
        assert_eq!(order_key(17), order_key(17));
    }
}
