use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StockResult;
use crate::models::*;
use crate::store::{
    CommitOutcome, LedgerStore, ReleaseRecord, ReserveOutcome, StockCandidate,
};

#[derive(Default)]
struct Inner {
    warehouse_priorities: HashMap<Uuid, i32>,
    stock_items: HashMap<Uuid, StockItem>,
    reservations: HashMap<Uuid, Reservation>,
    requests: HashMap<(String, String), IdempotentRequest>,
    outbox: Vec<OutboxMessage>,
    inbox: HashMap<String, InboxMessage>,
}

/// In-memory `LedgerStore` for tests and development.
///
/// A single mutex around the whole state makes every trait method atomic,
/// mirroring the per-statement / per-transaction atomicity of the Postgres
/// store.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_warehouse(&self, warehouse_id: Uuid, priority: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.warehouse_priorities.insert(warehouse_id, priority);
    }

    pub fn add_stock_item(&self, item: StockItem) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .warehouse_priorities
            .entry(item.warehouse_id)
            .or_insert(0);
        inner.stock_items.insert(item.id, item);
    }

    pub fn outbox_snapshot(&self) -> Vec<OutboxMessage> {
        self.inner.lock().unwrap().outbox.clone()
    }

    pub fn unprocessed_outbox_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .outbox
            .iter()
            .filter(|m| !m.processed)
            .count()
    }

    fn push_outbox(inner: &mut Inner, message: NewOutboxMessage) {
        inner.outbox.push(OutboxMessage {
            id: message.id,
            message_id: message.message_id,
            event_type: message.event_type,
            content: message.content,
            destination: message.destination,
            occurred_on: message.occurred_on,
            processed: false,
            processed_on: None,
            locked_by: None,
            locked_at: None,
            retry_count: 0,
        });
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn available_stock(
        &self,
        product_id: Uuid,
        variation_id: Option<Uuid>,
    ) -> StockResult<Vec<StockCandidate>> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<StockCandidate> = inner
            .stock_items
            .values()
            .filter(|item| {
                item.is_active
                    && item.product_id == product_id
                    && item.variation_id == variation_id
                    && item.available_quantity > 0
            })
            .map(|item| StockCandidate {
                item: item.clone(),
                warehouse_priority: inner
                    .warehouse_priorities
                    .get(&item.warehouse_id)
                    .copied()
                    .unwrap_or(0),
            })
            .collect();
        candidates.sort_by_key(|c| c.warehouse_priority);
        Ok(candidates)
    }

    async fn get_stock_item(&self, id: Uuid) -> StockResult<Option<StockItem>> {
        Ok(self.inner.lock().unwrap().stock_items.get(&id).cloned())
    }

    async fn get_reservation(&self, id: Uuid) -> StockResult<Option<Reservation>> {
        Ok(self.inner.lock().unwrap().reservations.get(&id).cloned())
    }

    async fn find_pending_cart_reservation(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> StockResult<Option<Reservation>> {
        let inner = self.inner.lock().unwrap();
        let found = inner
            .reservations
            .values()
            .find(|r| {
                r.cart_id == Some(cart_id)
                    && r.status() == Some(ReservationStatus::Pending)
                    && inner
                        .stock_items
                        .get(&r.stock_item_id)
                        .map(|item| item.product_id == product_id)
                        .unwrap_or(false)
            })
            .cloned();
        Ok(found)
    }

    async fn pending_cart_reservations(&self, cart_id: Uuid) -> StockResult<Vec<Reservation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .reservations
            .values()
            .filter(|r| {
                r.cart_id == Some(cart_id) && r.status() == Some(ReservationStatus::Pending)
            })
            .cloned()
            .collect())
    }

    async fn expired_pending_reservations(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StockResult<Vec<Reservation>> {
        let inner = self.inner.lock().unwrap();
        let mut expired: Vec<Reservation> = inner
            .reservations
            .values()
            .filter(|r| {
                r.status() == Some(ReservationStatus::Pending)
                    && r.expires_at.map(|e| e <= cutoff).unwrap_or(false)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit as usize);
        Ok(expired)
    }

    async fn create_reservation(
        &self,
        reservation: NewReservation,
        event: NewOutboxMessage,
    ) -> StockResult<ReserveOutcome> {
        let mut inner = self.inner.lock().unwrap();

        let quantity = reservation.reserved_quantity;
        let item = match inner.stock_items.get_mut(&reservation.stock_item_id) {
            Some(item) if item.is_active && item.available_quantity >= quantity => item,
            Some(item) if item.is_active => {
                let available = item.available_quantity;
                return Ok(ReserveOutcome::InsufficientStock { available });
            }
            _ => return Ok(ReserveOutcome::InsufficientStock { available: 0 }),
        };
        item.available_quantity -= quantity;
        item.reserved_quantity += quantity;
        item.updated_at = reservation.reserved_at;
        let item = item.clone();

        inner.reservations.insert(
            reservation.id,
            Reservation {
                id: reservation.id,
                stock_item_id: reservation.stock_item_id,
                cart_id: reservation.cart_id,
                order_id: reservation.order_id,
                customer_id: reservation.customer_id,
                reserved_quantity: reservation.reserved_quantity,
                status: reservation.status,
                reservation_type: reservation.reservation_type,
                reserved_at: reservation.reserved_at,
                expires_at: reservation.expires_at,
                released_at: None,
                updated_at: reservation.updated_at,
            },
        );
        Self::push_outbox(&mut inner, event);

        Ok(ReserveOutcome::Reserved(item))
    }

    async fn commit_reservation(
        &self,
        reservation_id: Uuid,
        order_id: Uuid,
        now: DateTime<Utc>,
        event: NewOutboxMessage,
    ) -> StockResult<CommitOutcome> {
        let mut inner = self.inner.lock().unwrap();

        let outcome = match inner.reservations.get_mut(&reservation_id) {
            None => CommitOutcome::NotFound,
            Some(r) if r.status() == Some(ReservationStatus::Pending) => {
                r.status = ReservationStatus::Committed.as_str().to_string();
                r.order_id = Some(order_id);
                r.expires_at = None;
                r.updated_at = now;
                CommitOutcome::Committed(r.clone())
            }
            Some(r)
                if r.status() == Some(ReservationStatus::Committed)
                    && r.order_id == Some(order_id) =>
            {
                CommitOutcome::AlreadyCommitted(r.clone())
            }
            Some(r) => CommitOutcome::NotPending(r.clone()),
        };

        if matches!(outcome, CommitOutcome::Committed(_)) {
            Self::push_outbox(&mut inner, event);
        }
        Ok(outcome)
    }

    async fn release_reservation(
        &self,
        reservation_id: Uuid,
        terminal: ReservationStatus,
        now: DateTime<Utc>,
        event: NewOutboxMessage,
    ) -> StockResult<Option<ReleaseRecord>> {
        let mut inner = self.inner.lock().unwrap();

        // Check both rows before mutating either, like the transactional
        // store where a missing stock item rolls the whole release back.
        let (stock_item_id, quantity) = match inner.reservations.get(&reservation_id) {
            Some(r) if r.status() == Some(ReservationStatus::Pending) => {
                (r.stock_item_id, r.reserved_quantity)
            }
            _ => return Ok(None),
        };
        if !inner.stock_items.contains_key(&stock_item_id) {
            return Ok(None);
        }

        let reservation = match inner.reservations.get_mut(&reservation_id) {
            Some(r) => {
                r.status = terminal.as_str().to_string();
                r.released_at = Some(now);
                r.updated_at = now;
                r.clone()
            }
            None => return Ok(None),
        };
        let stock_item = match inner.stock_items.get_mut(&stock_item_id) {
            Some(item) => {
                item.available_quantity += quantity;
                item.reserved_quantity -= quantity;
                item.updated_at = now;
                item.clone()
            }
            None => return Ok(None),
        };
        Self::push_outbox(&mut inner, event);

        Ok(Some(ReleaseRecord {
            reservation,
            stock_item,
        }))
    }

    async fn expire_stock_batches(&self, now: DateTime<Utc>) -> StockResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut affected = 0;
        for item in inner.stock_items.values_mut() {
            if item.is_active && item.expiry_date.map(|e| e <= now).unwrap_or(false) {
                item.damaged_quantity += item.available_quantity;
                item.available_quantity = 0;
                item.is_active = false;
                item.updated_at = now;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn recalculate_safety_stock(&self, now: DateTime<Utc>) -> StockResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut affected = 0;
        for item in inner.stock_items.values_mut() {
            if item.is_active && item.minimum_level.is_some() {
                let on_hand =
                    item.available_quantity + item.reserved_quantity + item.in_transit_quantity;
                item.minimum_level = Some((on_hand + 4) / 5);
                item.updated_at = now;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn find_request(
        &self,
        key: &str,
        subject_id: &str,
    ) -> StockResult<Option<IdempotentRequest>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .requests
            .get(&(key.to_string(), subject_id.to_string()))
            .cloned())
    }

    async fn try_insert_request(&self, request: NewIdempotentRequest) -> StockResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let slot = (request.key.clone(), request.subject_id.clone());
        if inner.requests.contains_key(&slot) {
            return Ok(false);
        }
        inner.requests.insert(
            slot,
            IdempotentRequest {
                key: request.key,
                subject_id: request.subject_id,
                request_hash: request.request_hash,
                locked_until: request.locked_until,
                expires_on: request.expires_on,
                response_body: None,
                status_code: None,
                created_at: request.created_at,
            },
        );
        Ok(true)
    }

    async fn try_reclaim_request(
        &self,
        key: &str,
        subject_id: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
        expires_on: Option<DateTime<Utc>>,
        request_hash: Option<String>,
    ) -> StockResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let record = match inner
            .requests
            .get_mut(&(key.to_string(), subject_id.to_string()))
        {
            Some(r) => r,
            None => return Ok(false),
        };

        let lock_stale = record.response_body.is_none()
            && record.locked_until.map(|l| l <= now).unwrap_or(true);
        let response_expired = record.expires_on.map(|e| e <= now).unwrap_or(false);
        if !lock_stale && !response_expired {
            return Ok(false);
        }

        record.locked_until = Some(locked_until);
        record.expires_on = expires_on;
        record.response_body = None;
        record.status_code = None;
        record.request_hash = request_hash;
        Ok(true)
    }

    async fn complete_request(
        &self,
        key: &str,
        subject_id: &str,
        response_body: serde_json::Value,
        status_code: i16,
    ) -> StockResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner
            .requests
            .get_mut(&(key.to_string(), subject_id.to_string()))
        {
            record.response_body = Some(response_body);
            record.status_code = Some(status_code);
            record.locked_until = None;
        }
        Ok(())
    }

    async fn clear_request_lock(&self, key: &str, subject_id: &str) -> StockResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner
            .requests
            .get_mut(&(key.to_string(), subject_id.to_string()))
        {
            record.locked_until = None;
        }
        Ok(())
    }

    async fn append_outbox(&self, message: NewOutboxMessage) -> StockResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::push_outbox(&mut inner, message);
        Ok(())
    }

    async fn due_outbox_messages(
        &self,
        lease_cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StockResult<Vec<OutboxMessage>> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<OutboxMessage> = inner
            .outbox
            .iter()
            .filter(|m| !m.processed && m.locked_at.map(|l| l < lease_cutoff).unwrap_or(true))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.occurred_on);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn try_claim_outbox(
        &self,
        id: Uuid,
        instance: &str,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> StockResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let message = match inner.outbox.iter_mut().find(|m| m.id == id) {
            Some(m) => m,
            None => return Ok(false),
        };
        if message.processed || message.locked_at.map(|l| l >= lease_cutoff).unwrap_or(false) {
            return Ok(false);
        }
        message.locked_by = Some(instance.to_string());
        message.locked_at = Some(now);
        Ok(true)
    }

    async fn mark_outbox_processed(&self, id: Uuid, now: DateTime<Utc>) -> StockResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.outbox.iter_mut().find(|m| m.id == id) {
            message.processed = true;
            message.processed_on = Some(now);
            message.locked_by = None;
            message.locked_at = None;
        }
        Ok(())
    }

    async fn release_outbox_claim(&self, id: Uuid) -> StockResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.outbox.iter_mut().find(|m| m.id == id) {
            message.locked_by = None;
            message.locked_at = None;
            message.retry_count += 1;
        }
        Ok(())
    }

    async fn try_insert_inbox(&self, message: NewInboxMessage) -> StockResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.inbox.contains_key(&message.message_id) {
            return Ok(false);
        }
        inner.inbox.insert(
            message.message_id.clone(),
            InboxMessage {
                message_id: message.message_id,
                message_type: message.message_type,
                content: message.content,
                consumer: message.consumer,
                status: message.status,
                received_at: message.received_at,
                processed_on: None,
            },
        );
        Ok(true)
    }

    async fn get_inbox_message(&self, message_id: &str) -> StockResult<Option<InboxMessage>> {
        Ok(self.inner.lock().unwrap().inbox.get(message_id).cloned())
    }

    async fn mark_inbox_processed(&self, message_id: &str, now: DateTime<Utc>) -> StockResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.inbox.get_mut(message_id) {
            message.status = INBOX_PROCESSED.to_string();
            message.processed_on = Some(now);
        }
        Ok(())
    }
}
