//! End-to-end flow over the in-memory store: reserve under the idempotency
//! coordinator, commit, drain the outbox, and consume the published events
//! through the inbox — including the dispatcher-crash / duplicate-delivery
//! path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use shared::{ReservationKind, ReserveStockData, ReserveStockResult, EVENT_STOCK_COMMITTED, EVENT_STOCK_RESERVED};
use stock_service::clock::{Clock, ManualClock};
use stock_service::idempotency::{IdempotencyCoordinator, StoredResponse};
use stock_service::inbox::{InboxOutcome, InboxProcessor};
use stock_service::models::StockItem;
use stock_service::outbox::{
    EventPublisher, OutboxDispatcher, RecordingPublisher, DEFAULT_LEASE_MINUTES,
};
use stock_service::reservation::ReservationLifecycleManager;
use stock_service::store::memory::MemoryLedgerStore;
use stock_service::store::LedgerStore;

struct Harness {
    store: Arc<MemoryLedgerStore>,
    clock: Arc<ManualClock>,
    manager: ReservationLifecycleManager,
    coordinator: IdempotencyCoordinator,
    publisher: RecordingPublisher,
    dispatcher: OutboxDispatcher,
    inbox: InboxProcessor,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryLedgerStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let publisher = RecordingPublisher::new();
    Harness {
        manager: ReservationLifecycleManager::new(store.clone(), clock.clone()),
        coordinator: IdempotencyCoordinator::new(store.clone(), clock.clone()),
        dispatcher: OutboxDispatcher::new(
            store.clone(),
            Arc::new(publisher.clone()),
            clock.clone(),
        ),
        inbox: InboxProcessor::new(store.clone(), clock.clone(), "order-service"),
        store,
        clock,
        publisher,
    }
}

fn seed_stock(store: &MemoryLedgerStore, product_id: Uuid, available: i32) -> Uuid {
    let item = StockItem {
        id: Uuid::new_v4(),
        product_id,
        variation_id: None,
        warehouse_id: Uuid::new_v4(),
        sku: Some("SKU-1".to_string()),
        available_quantity: available,
        reserved_quantity: 0,
        in_transit_quantity: 0,
        damaged_quantity: 0,
        minimum_level: None,
        maximum_level: None,
        expiry_date: None,
        batch_number: None,
        is_active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let id = item.id;
    store.add_stock_item(item);
    id
}

fn reserve_request(product_id: Uuid, quantity: i32) -> ReserveStockData {
    ReserveStockData {
        product_id,
        variation_id: None,
        warehouse_id: None,
        cart_id: Some(Uuid::new_v4()),
        order_id: None,
        customer_id: None,
        quantity,
        reservation_type: ReservationKind::Cart,
        ttl_minutes: None,
    }
}

#[tokio::test]
async fn reserve_commit_publish_consume_round_trip() {
    let h = harness();
    let product_id = Uuid::new_v4();
    let item_id = seed_stock(&h.store, product_id, 10);

    // Reserve under the coordinator, as a request path would.
    let request = reserve_request(product_id, 4);
    let manager = h.manager.clone();
    let stored = h
        .coordinator
        .execute("req-1", None, None, Duration::hours(1), || async move {
            let result = manager.reserve(&request).await?;
            Ok(StoredResponse {
                body: serde_json::to_value(result).unwrap(),
                status_code: 201,
            })
        })
        .await
        .unwrap();
    let result: ReserveStockResult = serde_json::from_value(stored.body).unwrap();
    assert!(result.success);
    assert_eq!(result.stock_item_id, item_id);

    let order_id = Uuid::new_v4();
    assert!(h.manager.commit(result.reservation_id, order_id).await.unwrap());

    // Both state changes are sitting in the outbox, oldest first.
    assert_eq!(h.store.unprocessed_outbox_count(), 2);
    assert_eq!(h.dispatcher.drain_once().await.unwrap(), 2);
    let published = h.publisher.published();
    assert_eq!(published[0].event_type, EVENT_STOCK_RESERVED);
    assert_eq!(published[1].event_type, EVENT_STOCK_COMMITTED);

    // Consumer side: each event handled exactly once through the inbox.
    let handled = AtomicUsize::new(0);
    for event in &published {
        let outcome = h
            .inbox
            .process_once(
                &event.message_id.to_string(),
                &event.event_type,
                event.payload.clone(),
                || async {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, InboxOutcome::Processed);
    }
    assert_eq!(handled.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dispatcher_crash_does_not_lose_or_duplicate_effects() {
    let h = harness();
    let product_id = Uuid::new_v4();
    seed_stock(&h.store, product_id, 5);

    h.manager.reserve(&reserve_request(product_id, 2)).await.unwrap();

    // First dispatcher claims the message, publishes it, then crashes before
    // marking it processed.
    let message = h.store.outbox_snapshot().pop().unwrap();
    let now = h.clock.now();
    assert!(h
        .store
        .try_claim_outbox(
            message.id,
            "crashed-instance",
            now,
            now - Duration::minutes(DEFAULT_LEASE_MINUTES)
        )
        .await
        .unwrap());
    h.publisher
        .publish(
            "stock-events",
            message.message_id,
            &message.event_type,
            &message.content,
        )
        .await
        .unwrap();

    // After the lease expires, a healthy dispatcher re-delivers the message
    // rather than leaving it stuck.
    h.clock.advance(Duration::minutes(DEFAULT_LEASE_MINUTES + 1));
    assert_eq!(h.dispatcher.drain_once().await.unwrap(), 1);
    assert_eq!(h.store.unprocessed_outbox_count(), 0);

    // The transport saw the event twice; the consumer's handler still runs
    // exactly once.
    let published = h.publisher.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].message_id, published[1].message_id);

    let handled = AtomicUsize::new(0);
    for event in &published {
        h.inbox
            .process_once(
                &event.message_id.to_string(),
                &event.event_type,
                event.payload.clone(),
                || async {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await
            .unwrap();
    }
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cart_dedup_holds_across_different_idempotency_keys() {
    let h = harness();
    let product_id = Uuid::new_v4();
    seed_stock(&h.store, product_id, 10);

    let request = reserve_request(product_id, 3);
    let mut ids = Vec::new();
    for key in ["key-a", "key-b"] {
        let request = request.clone();
        let manager = h.manager.clone();
        let stored = h
            .coordinator
            .execute(key, None, None, Duration::hours(1), || async move {
                let result = manager.reserve(&request).await?;
                Ok(StoredResponse {
                    body: serde_json::to_value(result).unwrap(),
                    status_code: 201,
                })
            })
            .await
            .unwrap();
        let result: ReserveStockResult = serde_json::from_value(stored.body).unwrap();
        ids.push(result.reservation_id);
    }
    assert_eq!(ids[0], ids[1]);
}
