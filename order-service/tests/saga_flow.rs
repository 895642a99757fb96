//! End-to-end saga scenarios against the in-memory store, cache and sink.
//!
//! These exercise the full coordinator logic without external services;
//! the wire-level paths are covered by the ignored tests in
//! `live_backends.rs`, which need running infrastructure.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use order_service::broker::{EventPublisher, MemoryEventSink};
use order_service::cache::{InMemoryStockCache, StockCache};
use order_service::error::OrderError;
use order_service::inventory::InventoryService;
use order_service::orders::{CreateOrderRequest, OrderItemRequest, OrderService};
use order_service::saga::SagaOrchestrator;
use order_service::store::{MemoryStore, Store};
use shared::{EventType, PaymentFailedEvent, PaymentSuccessEvent};

struct Harness {
    store: MemoryStore,
    cache: InMemoryStockCache,
    sink: MemoryEventSink,
    orders: OrderService,
    saga: SagaOrchestrator,
}

async fn harness(stock: &[(i64, i32)]) -> Harness {
    let store = MemoryStore::new();
    let cache = InMemoryStockCache::new();
    let sink = MemoryEventSink::new();
    let events = Arc::new(EventPublisher::new(Arc::new(sink.clone())));
    let inventory = Arc::new(InventoryService::new(
        Arc::new(store.clone()),
        Arc::new(cache.clone()),
    ));
    let orders = OrderService::new(Arc::new(store.clone()), inventory.clone(), events.clone());
    let saga = SagaOrchestrator::new(Arc::new(store.clone()), inventory, events);

    for (index, (price_cents, available)) in stock.iter().enumerate() {
        let product = store.seed_product(
            &format!("SKU-{}", index + 1),
            "Test product",
            *price_cents,
            *available,
        );
        cache.init(product.id, *available, 0).await.unwrap();
    }

    Harness {
        store,
        cache,
        sink,
        orders,
        saga,
    }
}

fn request(user_id: i64, items: &[(i64, i32)], key: Option<&str>) -> CreateOrderRequest {
    CreateOrderRequest {
        user_id,
        items: items
            .iter()
            .map(|(product_id, quantity)| OrderItemRequest {
                product_id: *product_id,
                quantity: *quantity,
            })
            .collect(),
        payment_method: "mock".to_string(),
        idempotency_key: key.map(str::to_string),
    }
}

async fn wait_for_inventory(store: &MemoryStore, product_id: i64, expected: (i32, i32)) {
    for _ in 0..200 {
        let row = store.inventory(product_id).await.unwrap().unwrap();
        if (row.available, row.reserved) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let row = store.inventory(product_id).await.unwrap().unwrap();
    panic!(
        "inventory for product {} stuck at ({}, {}), expected {:?}",
        product_id, row.available, row.reserved, expected
    );
}

async fn order_status(store: &MemoryStore, order_id: i64) -> String {
    store
        .order_by_id(order_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn happy_path_confirms_order_and_deducts_stock() {
    let h = harness(&[(1_500_000, 100)]).await;

    let response = h
        .orders
        .submit_order(request(100, &[(1, 2)], None), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.order_id, 1);
    assert_eq!(response.status, "RESERVED");
    wait_for_inventory(&h.store, 1, (98, 2)).await;

    let event = PaymentSuccessEvent::new(1, 1, 3_000_000, "TXN-test1234");
    h.saga.on_payment_success(&event).await.unwrap();

    assert_eq!(order_status(&h.store, 1).await, "CONFIRMED");
    wait_for_inventory(&h.store, 1, (98, 0)).await;
    assert_eq!(h.cache.get(1).await.unwrap(), (98, 0));
}

#[tokio::test]
async fn payment_failure_cancels_and_restores_stock() {
    let h = harness(&[(1_500_000, 100)]).await;

    let response = h
        .orders
        .submit_order(request(100, &[(1, 2)], None), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.status, "RESERVED");
    wait_for_inventory(&h.store, 1, (98, 2)).await;

    let event = PaymentFailedEvent::new(response.order_id, 1, "card_declined");
    h.saga.on_payment_failed(&event).await.unwrap();

    assert_eq!(order_status(&h.store, response.order_id).await, "CANCELLED");
    wait_for_inventory(&h.store, 1, (100, 0)).await;
    assert_eq!(h.cache.get(1).await.unwrap(), (100, 0));
}

#[tokio::test]
async fn resubmit_with_same_key_returns_same_order() {
    let h = harness(&[(1_500_000, 100)]).await;

    let first = h
        .orders
        .submit_order(request(100, &[(1, 2)], Some("key-1")), CancellationToken::new())
        .await
        .unwrap();
    let second = h
        .orders
        .submit_order(request(100, &[(1, 2)], Some("key-1")), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.order_id, second.order_id);
    assert_eq!(second.status, "RESERVED");

    // Inventory decremented exactly once.
    wait_for_inventory(&h.store, 1, (98, 2)).await;
    assert_eq!(h.cache.get(1).await.unwrap(), (98, 2));

    let (order, items) = h.orders.get_order(first.order_id).await.unwrap();
    assert_eq!(order.id, first.order_id);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].unit_price_cents, 1_500_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn oversell_burst_grants_exactly_the_stock() {
    let h = harness(&[(1_500_000, 100)]).await;
    let orders = Arc::new(h.orders);

    let mut tasks = Vec::new();
    for user in 0..500 {
        let orders = orders.clone();
        tasks.push(tokio::spawn(async move {
            orders
                .submit_order(request(user + 1, &[(1, 1)], None), CancellationToken::new())
                .await
        }));
    }

    let mut reserved_ids = Vec::new();
    let mut denied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(response) => {
                assert_eq!(response.status, "RESERVED");
                reserved_ids.push(response.order_id);
            }
            Err(OrderError::InsufficientStock(1)) => denied += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(reserved_ids.len(), 100);
    assert_eq!(denied, 400);
    assert_eq!(h.cache.get(1).await.unwrap(), (0, 100));
    wait_for_inventory(&h.store, 1, (0, 100)).await;

    // Settle every reserved order; stock moves out of reserved.
    for order_id in &reserved_ids {
        let event = PaymentSuccessEvent::new(*order_id, *order_id, 1_500_000, "TXN-burst");
        h.saga.on_payment_success(&event).await.unwrap();
    }
    wait_for_inventory(&h.store, 1, (0, 0)).await;
    assert_eq!(h.cache.get(1).await.unwrap(), (0, 0));
}

#[tokio::test]
async fn duplicate_payment_event_applies_once() {
    let h = harness(&[(1_500_000, 100)]).await;

    let response = h
        .orders
        .submit_order(request(100, &[(1, 2)], None), CancellationToken::new())
        .await
        .unwrap();
    wait_for_inventory(&h.store, 1, (98, 2)).await;

    let event = PaymentSuccessEvent::new(response.order_id, 1, 3_000_000, "TXN-dup");
    for _ in 0..3 {
        h.saga.on_payment_success(&event).await.unwrap();
    }

    assert_eq!(order_status(&h.store, response.order_id).await, "CONFIRMED");
    assert_eq!(h.store.processed_event_count(), 1);
    // A replayed commit would have driven reserved negative.
    wait_for_inventory(&h.store, 1, (98, 0)).await;
}

#[tokio::test]
async fn partial_reservation_is_compensated_and_order_fails() {
    let h = harness(&[(1_500_000, 100), (500_000, 100)]).await;

    let err = h
        .orders
        .submit_order(
            request(100, &[(1, 50), (2, 200)], None),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::InsufficientStock(2)));

    assert_eq!(order_status(&h.store, 1).await, "FAILED");
    // Product 1's 50 units were released again; product 2 was never touched.
    assert_eq!(h.cache.get(1).await.unwrap(), (100, 0));
    assert_eq!(h.cache.get(2).await.unwrap(), (100, 0));
    wait_for_inventory(&h.store, 1, (100, 0)).await;
    wait_for_inventory(&h.store, 2, (100, 0)).await;
}

#[tokio::test]
async fn unknown_product_rejects_before_any_side_effect() {
    let h = harness(&[(1_500_000, 100)]).await;

    let err = h
        .orders
        .submit_order(request(100, &[(99, 1)], None), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::InvalidInput(_)));

    assert_eq!(h.cache.get(1).await.unwrap(), (100, 0));
    assert!(h.store.order_by_id(1).await.unwrap().is_none());
}

#[tokio::test]
async fn reserved_event_reaches_the_sink_via_outbox_drain() {
    use order_service::outbox::OutboxProcessor;

    let h = harness(&[(1_500_000, 100)]).await;
    let response = h
        .orders
        .submit_order(request(100, &[(1, 1)], None), CancellationToken::new())
        .await
        .unwrap();

    // OrderCreated was published directly; OrderReserved waits in the outbox.
    let direct: Vec<_> = h.sink.messages();
    assert!(direct.iter().any(|(_, payload)| payload.contains("ORDER_CREATED")));
    assert!(!direct.iter().any(|(_, payload)| payload.contains("ORDER_RESERVED")));

    let events = Arc::new(EventPublisher::new(Arc::new(h.sink.clone())));
    let processor = OutboxProcessor::new(Arc::new(h.store.clone()), events);
    assert_eq!(processor.drain().await.unwrap(), 1);

    let messages = h.sink.messages();
    let reserved: Vec<_> = messages
        .iter()
        .filter(|(_, payload)| payload.contains("ORDER_RESERVED"))
        .collect();
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].0, format!("order-{}", response.order_id));

    let header: shared::EventHeader = serde_json::from_str(&reserved[0].1).unwrap();
    assert_eq!(header.event_type, EventType::OrderReserved);
}

#[tokio::test]
async fn cancelled_request_compensates_partial_reservations() {
    let h = harness(&[(1_500_000, 100), (500_000, 100)]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .orders
        .submit_order(request(100, &[(1, 10), (2, 10)], None), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Cancelled));

    assert_eq!(order_status(&h.store, 1).await, "FAILED");
    assert_eq!(h.cache.get(1).await.unwrap(), (100, 0));
    assert_eq!(h.cache.get(2).await.unwrap(), (100, 0));
}
