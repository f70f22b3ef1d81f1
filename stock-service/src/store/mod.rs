pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StockResult;
use crate::models::{
    IdempotentRequest, InboxMessage, NewIdempotentRequest, NewInboxMessage, NewOutboxMessage,
    NewReservation, OutboxMessage, Reservation, ReservationStatus, StockItem,
};

/// A stock item paired with its warehouse's priority, as loaded for the
/// allocation engine. Lower priority number means preferred.
#[derive(Debug, Clone)]
pub struct StockCandidate {
    pub item: StockItem,
    pub warehouse_priority: i32,
}

#[derive(Debug)]
pub enum ReserveOutcome {
    /// The conditional decrement succeeded; carries the post-update item so
    /// callers can evaluate low-stock thresholds without re-reading.
    Reserved(StockItem),
    /// Lost the race: available quantity dropped below the requested amount
    /// between the availability check and the conditional update.
    InsufficientStock { available: i32 },
}

#[derive(Debug)]
pub enum CommitOutcome {
    Committed(Reservation),
    /// Already committed for the same order; treated as success by callers.
    AlreadyCommitted(Reservation),
    NotPending(Reservation),
    NotFound,
}

#[derive(Debug)]
pub struct ReleaseRecord {
    pub reservation: Reservation,
    pub stock_item: StockItem,
}

/// Transactional storage for stock items, reservations, idempotent-request
/// records and outbox/inbox rows.
///
/// Every mutation of stock quantities or reservation status goes through a
/// conditional update; races surface as affected-row counts (`bool` /
/// `Option`), never as exceptions. The `*_reservation` operations write their
/// outbox event in the same transaction as the state change.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ---- stock & reservations ----

    /// Active stock items with available quantity for a product (and exact
    /// variation match), joined with warehouse priority.
    async fn available_stock(
        &self,
        product_id: Uuid,
        variation_id: Option<Uuid>,
    ) -> StockResult<Vec<StockCandidate>>;

    async fn get_stock_item(&self, id: Uuid) -> StockResult<Option<StockItem>>;

    async fn get_reservation(&self, id: Uuid) -> StockResult<Option<Reservation>>;

    /// Pending reservation for the same (cart, product), used for
    /// business-level dedup of repeated add-to-cart requests.
    async fn find_pending_cart_reservation(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> StockResult<Option<Reservation>>;

    async fn pending_cart_reservations(&self, cart_id: Uuid) -> StockResult<Vec<Reservation>>;

    async fn expired_pending_reservations(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StockResult<Vec<Reservation>>;

    /// Atomically re-checks `available_quantity >= reserved_quantity` on the
    /// target item, moves the quantity from available to reserved, inserts
    /// the reservation row and the outbox event, all in one transaction.
    async fn create_reservation(
        &self,
        reservation: NewReservation,
        event: NewOutboxMessage,
    ) -> StockResult<ReserveOutcome>;

    /// Conditional on the reservation still being pending. Clears the expiry
    /// deadline and attaches the order id. Quantities are untouched.
    async fn commit_reservation(
        &self,
        reservation_id: Uuid,
        order_id: Uuid,
        now: DateTime<Utc>,
        event: NewOutboxMessage,
    ) -> StockResult<CommitOutcome>;

    /// Conditional on pending; moves the reserved quantity back to available
    /// and stamps the terminal status (`Released` or `Expired`). Returns
    /// `None` when the reservation was not pending (safe-retry no-op).
    async fn release_reservation(
        &self,
        reservation_id: Uuid,
        terminal: ReservationStatus,
        now: DateTime<Utc>,
        event: NewOutboxMessage,
    ) -> StockResult<Option<ReleaseRecord>>;

    /// Deactivates stock items whose expiry date has passed, moving any
    /// remaining available quantity into the damaged bucket.
    async fn expire_stock_batches(&self, now: DateTime<Utc>) -> StockResult<usize>;

    /// Recomputes `minimum_level` for tracked items as 20% of on-hand
    /// quantity, rounded up.
    async fn recalculate_safety_stock(&self, now: DateTime<Utc>) -> StockResult<usize>;

    // ---- idempotent requests ----

    async fn find_request(
        &self,
        key: &str,
        subject_id: &str,
    ) -> StockResult<Option<IdempotentRequest>>;

    /// Returns `false` on a uniqueness conflict (another caller holds the
    /// key) instead of an error.
    async fn try_insert_request(&self, request: NewIdempotentRequest) -> StockResult<bool>;

    /// Reclaims a stale record: lock expired with no stored response, or the
    /// stored response itself has passed its TTL. Conditional update; `false`
    /// means the record is still live.
    async fn try_reclaim_request(
        &self,
        key: &str,
        subject_id: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
        expires_on: Option<DateTime<Utc>>,
        request_hash: Option<String>,
    ) -> StockResult<bool>;

    async fn complete_request(
        &self,
        key: &str,
        subject_id: &str,
        response_body: serde_json::Value,
        status_code: i16,
    ) -> StockResult<()>;

    async fn clear_request_lock(&self, key: &str, subject_id: &str) -> StockResult<()>;

    // ---- outbox ----

    /// Standalone append, for advisory events emitted outside a reservation
    /// transaction (low-stock and out-of-stock alerts).
    async fn append_outbox(&self, message: NewOutboxMessage) -> StockResult<()>;

    /// Unprocessed messages that are unlocked or whose lease expired before
    /// `lease_cutoff`, oldest occurrence first.
    async fn due_outbox_messages(
        &self,
        lease_cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StockResult<Vec<OutboxMessage>>;

    /// Conditional claim; `false` means another dispatcher instance won.
    async fn try_claim_outbox(
        &self,
        id: Uuid,
        instance: &str,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> StockResult<bool>;

    async fn mark_outbox_processed(&self, id: Uuid, now: DateTime<Utc>) -> StockResult<()>;

    /// Clears the claim and bumps the retry counter after a publish failure.
    async fn release_outbox_claim(&self, id: Uuid) -> StockResult<()>;

    // ---- inbox ----

    /// Returns `false` when the message id was already recorded (duplicate
    /// delivery). Insertion is the deduplication point.
    async fn try_insert_inbox(&self, message: NewInboxMessage) -> StockResult<bool>;

    async fn get_inbox_message(&self, message_id: &str) -> StockResult<Option<InboxMessage>>;

    async fn mark_inbox_processed(&self, message_id: &str, now: DateTime<Utc>) -> StockResult<()>;
}
