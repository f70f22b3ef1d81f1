use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use shared::{
    LowStockAlert, OutOfStock, ReservationKind, ReserveStockData, ReserveStockResult,
    StockCommitted, StockReleased, StockReserved, EVENT_LOW_STOCK_ALERT, EVENT_OUT_OF_STOCK,
    EVENT_STOCK_COMMITTED, EVENT_STOCK_RELEASED, EVENT_STOCK_RESERVED,
};

use crate::allocation::{self, Availability};
use crate::clock::Clock;
use crate::error::{StockError, StockResult};
use crate::models::{NewOutboxMessage, NewReservation, ReservationStatus, StockItem};
use crate::store::{CommitOutcome, LedgerStore, ReserveOutcome};

pub const DEFAULT_RESERVATION_TTL_MINUTES: i64 = 15;
pub const REAPER_BATCH_SIZE: i64 = 100;

pub const RELEASE_REASON_EXPIRED: &str = "expired";
pub const RELEASE_REASON_CART_RELEASED: &str = "cart-released";

fn reservation_kind_str(kind: ReservationKind) -> &'static str {
    match kind {
        ReservationKind::Cart => "cart",
        ReservationKind::Order => "order",
        ReservationKind::PreOrder => "pre_order",
    }
}

/// Owns the reservation state machine and all stock quantity bookkeeping.
///
/// Reservations are born pending with an expiry deadline and move exactly
/// once to committed, released or expired. Every transition is a conditional
/// update on `status = pending`, so concurrent commit/release/expire attempts
/// race safely: one wins, the rest observe a no-op.
#[derive(Clone)]
pub struct ReservationLifecycleManager {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl ReservationLifecycleManager {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_ttl: Duration::minutes(DEFAULT_RESERVATION_TTL_MINUTES),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub async fn check_availability(
        &self,
        product_id: Uuid,
        variation_id: Option<Uuid>,
        quantity: i32,
        preferred_warehouse_id: Option<Uuid>,
    ) -> StockResult<Availability> {
        if quantity <= 0 {
            return Err(StockError::Validation(
                "quantity must be positive".to_string(),
            ));
        }
        let candidates = self.store.available_stock(product_id, variation_id).await?;
        Ok(allocation::check_availability(
            candidates,
            quantity,
            preferred_warehouse_id,
        ))
    }

    /// Reserves stock for the request, taking only the first allocation leg:
    /// a single reservation claims a single stock item, even when the plan
    /// spans warehouses. The returned `reserved_quantity` is that leg's
    /// quantity and may be less than the requested amount.
    pub async fn reserve(&self, request: &ReserveStockData) -> StockResult<ReserveStockResult> {
        if request.quantity <= 0 {
            return Err(StockError::Validation(
                "quantity must be positive".to_string(),
            ));
        }

        // Repeated add-to-cart for the same product returns the existing
        // pending reservation regardless of the idempotency key used.
        if let Some(cart_id) = request.cart_id {
            if let Some(existing) = self
                .store
                .find_pending_cart_reservation(cart_id, request.product_id)
                .await?
            {
                info!(
                    reservation_id = %existing.id,
                    %cart_id,
                    "returning existing pending cart reservation"
                );
                return Ok(ReserveStockResult {
                    reservation_id: existing.id,
                    stock_item_id: existing.stock_item_id,
                    reserved_quantity: existing.reserved_quantity,
                    expires_at: existing.expires_at,
                    success: true,
                    message: "existing reservation for this cart and product".to_string(),
                });
            }
        }

        let availability = self
            .check_availability(
                request.product_id,
                request.variation_id,
                request.quantity,
                request.warehouse_id,
            )
            .await?;
        if !availability.is_available {
            return Err(StockError::InsufficientStock {
                available: availability.total_available,
                requested: request.quantity,
            });
        }
        let leg = availability
            .allocations
            .first()
            .ok_or(StockError::InsufficientStock {
                available: 0,
                requested: request.quantity,
            })?;

        let now = self.clock.now();
        let ttl = request
            .ttl_minutes
            .map(Duration::minutes)
            .unwrap_or(self.default_ttl);
        let expires_at = Some(now + ttl);

        let reservation = NewReservation {
            id: Uuid::new_v4(),
            stock_item_id: leg.stock_item_id,
            cart_id: request.cart_id,
            order_id: request.order_id,
            customer_id: request.customer_id,
            reserved_quantity: leg.quantity,
            status: ReservationStatus::Pending.as_str().to_string(),
            reservation_type: reservation_kind_str(request.reservation_type).to_string(),
            reserved_at: now,
            expires_at,
            updated_at: now,
        };

        let event = NewOutboxMessage::new(
            EVENT_STOCK_RESERVED,
            serde_json::to_value(StockReserved {
                reservation_id: reservation.id,
                product_id: request.product_id,
                variation_id: request.variation_id,
                stock_item_id: leg.stock_item_id,
                quantity: leg.quantity,
                cart_id: request.cart_id,
                order_id: request.order_id,
                expires_at,
            })?,
            now,
        );

        let reservation_id = reservation.id;
        let reserved_quantity = reservation.reserved_quantity;
        match self.store.create_reservation(reservation, event).await? {
            ReserveOutcome::Reserved(item) => {
                info!(
                    %reservation_id,
                    stock_item_id = %item.id,
                    quantity = reserved_quantity,
                    "stock reserved"
                );
                self.emit_threshold_alerts(&item).await?;
                Ok(ReserveStockResult {
                    reservation_id,
                    stock_item_id: item.id,
                    reserved_quantity,
                    expires_at,
                    success: true,
                    message: "stock reserved".to_string(),
                })
            }
            ReserveOutcome::InsufficientStock { available } => {
                // Lost the race between the availability check and the
                // conditional decrement. The caller must re-check.
                Err(StockError::InsufficientStock {
                    available,
                    requested: request.quantity,
                })
            }
        }
    }

    pub async fn commit(&self, reservation_id: Uuid, order_id: Uuid) -> StockResult<bool> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| StockError::NotFound(format!("reservation {}", reservation_id)))?;

        let now = self.clock.now();
        let event = NewOutboxMessage::new(
            EVENT_STOCK_COMMITTED,
            serde_json::to_value(StockCommitted {
                reservation_id,
                order_id,
                stock_item_id: reservation.stock_item_id,
                quantity: reservation.reserved_quantity,
            })?,
            now,
        );

        match self
            .store
            .commit_reservation(reservation_id, order_id, now, event)
            .await?
        {
            CommitOutcome::Committed(_) => {
                info!(%reservation_id, %order_id, "reservation committed");
                Ok(true)
            }
            CommitOutcome::AlreadyCommitted(_) => Ok(true),
            CommitOutcome::NotFound => Err(StockError::NotFound(format!(
                "reservation {}",
                reservation_id
            ))),
            CommitOutcome::NotPending(_) => Err(StockError::InvalidState),
        }
    }

    /// Returns `false` when the reservation was not pending, which callers
    /// treat as an already-done no-op.
    pub async fn release(&self, reservation_id: Uuid, reason: Option<&str>) -> StockResult<bool> {
        self.release_as(reservation_id, ReservationStatus::Released, reason)
            .await
    }

    async fn release_as(
        &self,
        reservation_id: Uuid,
        terminal: ReservationStatus,
        reason: Option<&str>,
    ) -> StockResult<bool> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| StockError::NotFound(format!("reservation {}", reservation_id)))?;

        let now = self.clock.now();
        let reason = reason.unwrap_or("released").to_string();
        let event = NewOutboxMessage::new(
            EVENT_STOCK_RELEASED,
            serde_json::to_value(StockReleased {
                reservation_id,
                stock_item_id: reservation.stock_item_id,
                quantity: reservation.reserved_quantity,
                reason: reason.clone(),
            })?,
            now,
        );

        match self
            .store
            .release_reservation(reservation_id, terminal, now, event)
            .await?
        {
            Some(record) => {
                info!(
                    %reservation_id,
                    quantity = record.reservation.reserved_quantity,
                    status = terminal.as_str(),
                    reason,
                    "reservation released"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn release_cart(&self, cart_id: Uuid) -> StockResult<usize> {
        let pending = self.store.pending_cart_reservations(cart_id).await?;
        let mut released = 0;
        for reservation in pending {
            if self
                .release_as(
                    reservation.id,
                    ReservationStatus::Released,
                    Some(RELEASE_REASON_CART_RELEASED),
                )
                .await?
            {
                released += 1;
            }
        }
        info!(%cart_id, released, "cart reservations released");
        Ok(released)
    }

    /// Reaper entry point: each release is independently atomic, so multiple
    /// reaper instances racing on the same rows reap each row once.
    pub async fn release_expired(&self) -> StockResult<usize> {
        let now = self.clock.now();
        let expired = self
            .store
            .expired_pending_reservations(now, REAPER_BATCH_SIZE)
            .await?;
        let mut released = 0;
        for reservation in expired {
            if self
                .release_as(
                    reservation.id,
                    ReservationStatus::Expired,
                    Some(RELEASE_REASON_EXPIRED),
                )
                .await?
            {
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "expired reservations reaped");
        }
        Ok(released)
    }

    pub async fn expire_stock_batches(&self) -> StockResult<usize> {
        let affected = self.store.expire_stock_batches(self.clock.now()).await?;
        if affected > 0 {
            info!(affected, "expired stock batches deactivated");
        }
        Ok(affected)
    }

    pub async fn recalculate_safety_stock(&self) -> StockResult<usize> {
        let affected = self
            .store
            .recalculate_safety_stock(self.clock.now())
            .await?;
        Ok(affected)
    }

    async fn emit_threshold_alerts(&self, item: &StockItem) -> StockResult<()> {
        let now = self.clock.now();
        if item.available_quantity == 0 {
            warn!(stock_item_id = %item.id, "stock item out of stock");
            self.store
                .append_outbox(NewOutboxMessage::new(
                    EVENT_OUT_OF_STOCK,
                    serde_json::to_value(OutOfStock {
                        stock_item_id: item.id,
                        product_id: item.product_id,
                        warehouse_id: item.warehouse_id,
                    })?,
                    now,
                ))
                .await?;
        } else if let Some(minimum) = item.minimum_level {
            if item.available_quantity <= minimum {
                warn!(
                    stock_item_id = %item.id,
                    available = item.available_quantity,
                    minimum,
                    "stock item at or below minimum level"
                );
                self.store
                    .append_outbox(NewOutboxMessage::new(
                        EVENT_LOW_STOCK_ALERT,
                        serde_json::to_value(LowStockAlert {
                            stock_item_id: item.id,
                            product_id: item.product_id,
                            warehouse_id: item.warehouse_id,
                            available_quantity: item.available_quantity,
                            minimum_level: minimum,
                        })?,
                        now,
                    ))
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryLedgerStore;
    use chrono::Utc;

    fn stock_item(product_id: Uuid, warehouse_id: Uuid, available: i32) -> StockItem {
        StockItem {
            id: Uuid::new_v4(),
            product_id,
            variation_id: None,
            warehouse_id,
            sku: None,
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
        }
    }

    fn reserve_request(product_id: Uuid, quantity: i32) -> ReserveStockData {
        ReserveStockData {
            product_id,
            variation_id: None,
            warehouse_id: None,
            cart_id: None,
            order_id: None,
            customer_id: None,
            quantity,
            reservation_type: ReservationKind::Cart,
            ttl_minutes: None,
        }
    }

    struct Fixture {
        store: Arc<MemoryLedgerStore>,
        clock: Arc<ManualClock>,
        manager: ReservationLifecycleManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = ReservationLifecycleManager::new(store.clone(), clock.clone());
        Fixture {
            store,
            clock,
            manager,
        }
    }

    #[tokio::test]
    async fn reserve_moves_quantity_and_appends_event() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        let item = stock_item(product_id, Uuid::new_v4(), 10);
        let item_id = item.id;
        f.store.add_stock_item(item);

        let result = f.manager.reserve(&reserve_request(product_id, 4)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.reserved_quantity, 4);
        assert!(result.expires_at.is_some());

        let item = f.store.get_stock_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.available_quantity, 6);
        assert_eq!(item.reserved_quantity, 4);

        let outbox = f.store.outbox_snapshot();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, EVENT_STOCK_RESERVED);
    }

    #[tokio::test]
    async fn single_allocation_policy_reserves_first_leg_only() {
        // W1 (priority 1) has 10, W2 (priority 2) has 5. A request for 12 is
        // allocatable across both, but the reservation takes only the first
        // leg: 10 units at W1.
        let f = fixture();
        let product_id = Uuid::new_v4();
        let w1 = Uuid::new_v4();
        let w2 = Uuid::new_v4();
        f.store.add_warehouse(w1, 1);
        f.store.add_warehouse(w2, 2);
        let item1 = stock_item(product_id, w1, 10);
        let item1_id = item1.id;
        f.store.add_stock_item(item1);
        f.store.add_stock_item(stock_item(product_id, w2, 5));

        let availability = f
            .manager
            .check_availability(product_id, None, 12, None)
            .await
            .unwrap();
        assert!(availability.is_available);
        assert_eq!(availability.allocations.len(), 2);
        assert_eq!(availability.allocations[0].warehouse_id, w1);
        assert_eq!(availability.allocations[0].quantity, 10);
        assert_eq!(availability.allocations[1].warehouse_id, w2);
        assert_eq!(availability.allocations[1].quantity, 2);

        let result = f.manager.reserve(&reserve_request(product_id, 12)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stock_item_id, item1_id);
        assert_eq!(result.reserved_quantity, 10);
    }

    #[tokio::test]
    async fn insufficient_stock_reports_available_and_requested() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        f.store.add_stock_item(stock_item(product_id, Uuid::new_v4(), 3));

        let err = f
            .manager
            .reserve(&reserve_request(product_id, 5))
            .await
            .unwrap_err();
        match err {
            StockError::InsufficientStock {
                available,
                requested,
            } => {
                assert_eq!(available, 3);
                assert_eq!(requested, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f.store.outbox_snapshot().is_empty());
    }

    #[tokio::test]
    async fn cart_dedup_returns_existing_reservation() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        let cart_id = Uuid::new_v4();
        f.store.add_stock_item(stock_item(product_id, Uuid::new_v4(), 10));

        let mut request = reserve_request(product_id, 2);
        request.cart_id = Some(cart_id);

        let first = f.manager.reserve(&request).await.unwrap();
        // Different idempotency keys on the wire, same cart and product.
        let second = f.manager.reserve(&request).await.unwrap();

        assert_eq!(first.reservation_id, second.reservation_id);
        let item = f
            .store
            .get_stock_item(first.stock_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.reserved_quantity, 2);
    }

    #[tokio::test]
    async fn commit_clears_expiry_and_leaves_quantities() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        f.store.add_stock_item(stock_item(product_id, Uuid::new_v4(), 10));

        let reserved = f.manager.reserve(&reserve_request(product_id, 4)).await.unwrap();
        let order_id = Uuid::new_v4();
        assert!(f.manager.commit(reserved.reservation_id, order_id).await.unwrap());

        let reservation = f
            .store
            .get_reservation(reserved.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.status(), Some(ReservationStatus::Committed));
        assert_eq!(reservation.expires_at, None);
        assert_eq!(reservation.order_id, Some(order_id));

        let item = f
            .store
            .get_stock_item(reserved.stock_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.available_quantity, 6);
        assert_eq!(item.reserved_quantity, 4);

        // Committing again for the same order is idempotent success.
        assert!(f.manager.commit(reserved.reservation_id, order_id).await.unwrap());
        // A different order is a conflict.
        let err = f
            .manager
            .commit(reserved.reservation_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StockError::InvalidState));
    }

    #[tokio::test]
    async fn release_is_idempotent_and_restores_quantity_once() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        f.store.add_stock_item(stock_item(product_id, Uuid::new_v4(), 10));

        let reserved = f.manager.reserve(&reserve_request(product_id, 4)).await.unwrap();
        assert!(f.manager.release(reserved.reservation_id, None).await.unwrap());
        assert!(!f.manager.release(reserved.reservation_id, None).await.unwrap());

        let item = f
            .store
            .get_stock_item(reserved.stock_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.available_quantity, 10);
        assert_eq!(item.reserved_quantity, 0);
    }

    #[tokio::test]
    async fn release_after_commit_is_a_no_op() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        f.store.add_stock_item(stock_item(product_id, Uuid::new_v4(), 10));

        let reserved = f.manager.reserve(&reserve_request(product_id, 4)).await.unwrap();
        f.manager
            .commit(reserved.reservation_id, Uuid::new_v4())
            .await
            .unwrap();
        assert!(!f.manager.release(reserved.reservation_id, None).await.unwrap());

        let item = f
            .store
            .get_stock_item(reserved.stock_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.reserved_quantity, 4);
    }

    #[tokio::test]
    async fn reaper_expires_overdue_reservations_and_is_rerun_safe() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        f.store.add_stock_item(stock_item(product_id, Uuid::new_v4(), 10));

        let reserved = f.manager.reserve(&reserve_request(product_id, 4)).await.unwrap();
        assert_eq!(f.manager.release_expired().await.unwrap(), 0);

        f.clock
            .advance(Duration::minutes(DEFAULT_RESERVATION_TTL_MINUTES + 1));
        assert_eq!(f.manager.release_expired().await.unwrap(), 1);
        assert_eq!(f.manager.release_expired().await.unwrap(), 0);

        let reservation = f
            .store
            .get_reservation(reserved.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.status(), Some(ReservationStatus::Expired));

        let item = f
            .store
            .get_stock_item(reserved.stock_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.available_quantity, 10);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_oversell() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        let item = stock_item(product_id, Uuid::new_v4(), 9);
        let item_id = item.id;
        f.store.add_stock_item(item);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = f.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.reserve(&reserve_request(product_id, 3)).await
            }));
        }

        let mut reserved_total = 0;
        for handle in handles {
            if let Ok(result) = handle.await.unwrap() {
                reserved_total += result.reserved_quantity;
            }
        }
        assert!(reserved_total <= 9);

        let item = f.store.get_stock_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.reserved_quantity, reserved_total);
        assert_eq!(item.available_quantity, 9 - reserved_total);
        assert!(item.available_quantity >= 0);
    }

    #[tokio::test]
    async fn threshold_alerts_are_emitted() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        let mut item = stock_item(product_id, Uuid::new_v4(), 10);
        item.minimum_level = Some(8);
        f.store.add_stock_item(item);

        f.manager.reserve(&reserve_request(product_id, 3)).await.unwrap();
        let types: Vec<String> = f
            .store
            .outbox_snapshot()
            .into_iter()
            .map(|m| m.event_type)
            .collect();
        assert!(types.contains(&EVENT_LOW_STOCK_ALERT.to_string()));

        f.manager.reserve(&reserve_request(product_id, 7)).await.unwrap();
        let types: Vec<String> = f
            .store
            .outbox_snapshot()
            .into_iter()
            .map(|m| m.event_type)
            .collect();
        assert!(types.contains(&EVENT_OUT_OF_STOCK.to_string()));
    }

    #[tokio::test]
    async fn batch_expiry_deactivates_and_quarantines_stock() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        let mut item = stock_item(product_id, Uuid::new_v4(), 10);
        item.expiry_date = Some(f.clock.now() + Duration::days(1));
        let item_id = item.id;
        f.store.add_stock_item(item);

        assert_eq!(f.manager.expire_stock_batches().await.unwrap(), 0);
        f.clock.advance(Duration::days(2));
        assert_eq!(f.manager.expire_stock_batches().await.unwrap(), 1);

        let item = f.store.get_stock_item(item_id).await.unwrap().unwrap();
        assert!(!item.is_active);
        assert_eq!(item.available_quantity, 0);
        assert_eq!(item.damaged_quantity, 10);
    }

    #[tokio::test]
    async fn safety_stock_recalculated_for_tracked_items() {
        let f = fixture();
        let product_id = Uuid::new_v4();
        let mut tracked = stock_item(product_id, Uuid::new_v4(), 18);
        tracked.reserved_quantity = 2;
        tracked.minimum_level = Some(1);
        let tracked_id = tracked.id;
        f.store.add_stock_item(tracked);
        f.store.add_stock_item(stock_item(product_id, Uuid::new_v4(), 50));

        assert_eq!(f.manager.recalculate_safety_stock().await.unwrap(), 1);
        let item = f.store.get_stock_item(tracked_id).await.unwrap().unwrap();
        // ceil(20% of 20 on hand)
        assert_eq!(item.minimum_level, Some(4));
    }
}
