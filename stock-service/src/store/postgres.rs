use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::error::{StockError, StockResult};
use crate::models::*;
use crate::schema::*;
use crate::store::{
    CommitOutcome, LedgerStore, ReleaseRecord, ReserveOutcome, StockCandidate,
};

type DbPool = Pool<AsyncPgConnection>;

/// Production `LedgerStore` backed by Postgres via diesel-async.
///
/// Conditional updates use `RETURNING` (`get_result(...).optional()`) where
/// the post-update row is needed, and affected-row counts everywhere else.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: DbPool,
}

impl PgLedgerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> StockResult<PooledConnection<'_, AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| StockError::Store(e.to_string()))
    }
}

fn is_unique_violation(e: &diesel::result::Error) -> bool {
    matches!(
        e,
        diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn available_stock(
        &self,
        product_id: Uuid,
        variation_id: Option<Uuid>,
    ) -> StockResult<Vec<StockCandidate>> {
        let mut conn = self.conn().await?;

        let mut query = stock_items::table
            .inner_join(warehouses::table)
            .filter(stock_items::product_id.eq(product_id))
            .filter(stock_items::is_active.eq(true))
            .filter(warehouses::is_active.eq(true))
            .filter(stock_items::available_quantity.gt(0))
            .order(warehouses::priority.asc())
            .select((stock_items::all_columns, warehouses::priority))
            .into_boxed();

        query = match variation_id {
            Some(v) => query.filter(stock_items::variation_id.eq(v)),
            None => query.filter(stock_items::variation_id.is_null()),
        };

        let rows = query.load::<(StockItem, i32)>(&mut conn).await?;
        Ok(rows
            .into_iter()
            .map(|(item, warehouse_priority)| StockCandidate {
                item,
                warehouse_priority,
            })
            .collect())
    }

    async fn get_stock_item(&self, id: Uuid) -> StockResult<Option<StockItem>> {
        let mut conn = self.conn().await?;
        let item = stock_items::table
            .find(id)
            .first::<StockItem>(&mut conn)
            .await
            .optional()?;
        Ok(item)
    }

    async fn get_reservation(&self, id: Uuid) -> StockResult<Option<Reservation>> {
        let mut conn = self.conn().await?;
        let reservation = reservations::table
            .find(id)
            .first::<Reservation>(&mut conn)
            .await
            .optional()?;
        Ok(reservation)
    }

    async fn find_pending_cart_reservation(
        &self,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> StockResult<Option<Reservation>> {
        let mut conn = self.conn().await?;
        let reservation = reservations::table
            .inner_join(stock_items::table)
            .filter(reservations::cart_id.eq(cart_id))
            .filter(reservations::status.eq(ReservationStatus::Pending.as_str()))
            .filter(stock_items::product_id.eq(product_id))
            .select(reservations::all_columns)
            .first::<Reservation>(&mut conn)
            .await
            .optional()?;
        Ok(reservation)
    }

    async fn pending_cart_reservations(&self, cart_id: Uuid) -> StockResult<Vec<Reservation>> {
        let mut conn = self.conn().await?;
        let rows = reservations::table
            .filter(reservations::cart_id.eq(cart_id))
            .filter(reservations::status.eq(ReservationStatus::Pending.as_str()))
            .load::<Reservation>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn expired_pending_reservations(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StockResult<Vec<Reservation>> {
        let mut conn = self.conn().await?;
        let rows = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Pending.as_str()))
            .filter(reservations::expires_at.le(cutoff))
            .order(reservations::expires_at.asc())
            .limit(limit)
            .load::<Reservation>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn create_reservation(
        &self,
        reservation: NewReservation,
        event: NewOutboxMessage,
    ) -> StockResult<ReserveOutcome> {
        let mut conn = self.conn().await?;

        let outcome = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                Box::pin(async move {
                    let quantity = reservation.reserved_quantity;
                    let updated = diesel::update(
                        stock_items::table.filter(
                            stock_items::id
                                .eq(reservation.stock_item_id)
                                .and(stock_items::is_active.eq(true))
                                .and(stock_items::available_quantity.ge(quantity)),
                        ),
                    )
                    .set((
                        stock_items::available_quantity
                            .eq(stock_items::available_quantity - quantity),
                        stock_items::reserved_quantity
                            .eq(stock_items::reserved_quantity + quantity),
                        stock_items::updated_at.eq(reservation.reserved_at),
                    ))
                    .get_result::<StockItem>(conn)
                    .await
                    .optional()?;

                    let item = match updated {
                        Some(item) => item,
                        None => {
                            let available = stock_items::table
                                .find(reservation.stock_item_id)
                                .select(stock_items::available_quantity)
                                .first::<i32>(conn)
                                .await
                                .optional()?
                                .unwrap_or(0);
                            return Ok(ReserveOutcome::InsufficientStock { available });
                        }
                    };

                    diesel::insert_into(reservations::table)
                        .values(&reservation)
                        .execute(conn)
                        .await?;

                    diesel::insert_into(outbox_messages::table)
                        .values(&event)
                        .execute(conn)
                        .await?;

                    Ok(ReserveOutcome::Reserved(item))
                })
            })
            .await?;

        Ok(outcome)
    }

    async fn commit_reservation(
        &self,
        reservation_id: Uuid,
        order_id: Uuid,
        now: DateTime<Utc>,
        event: NewOutboxMessage,
    ) -> StockResult<CommitOutcome> {
        let mut conn = self.conn().await?;

        let outcome = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                Box::pin(async move {
                    let updated = diesel::update(
                        reservations::table.filter(
                            reservations::id
                                .eq(reservation_id)
                                .and(reservations::status.eq(ReservationStatus::Pending.as_str())),
                        ),
                    )
                    .set((
                        reservations::status.eq(ReservationStatus::Committed.as_str()),
                        reservations::order_id.eq(Some(order_id)),
                        reservations::expires_at.eq(None::<DateTime<Utc>>),
                        reservations::updated_at.eq(now),
                    ))
                    .get_result::<Reservation>(conn)
                    .await
                    .optional()?;

                    if let Some(reservation) = updated {
                        diesel::insert_into(outbox_messages::table)
                            .values(&event)
                            .execute(conn)
                            .await?;
                        return Ok(CommitOutcome::Committed(reservation));
                    }

                    let existing = reservations::table
                        .find(reservation_id)
                        .first::<Reservation>(conn)
                        .await
                        .optional()?;

                    Ok(match existing {
                        None => CommitOutcome::NotFound,
                        Some(r)
                            if r.status() == Some(ReservationStatus::Committed)
                                && r.order_id == Some(order_id) =>
                        {
                            CommitOutcome::AlreadyCommitted(r)
                        }
                        Some(r) => CommitOutcome::NotPending(r),
                    })
                })
            })
            .await?;

        Ok(outcome)
    }

    async fn release_reservation(
        &self,
        reservation_id: Uuid,
        terminal: ReservationStatus,
        now: DateTime<Utc>,
        event: NewOutboxMessage,
    ) -> StockResult<Option<ReleaseRecord>> {
        let mut conn = self.conn().await?;

        let record = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                Box::pin(async move {
                    let updated = diesel::update(
                        reservations::table.filter(
                            reservations::id
                                .eq(reservation_id)
                                .and(reservations::status.eq(ReservationStatus::Pending.as_str())),
                        ),
                    )
                    .set((
                        reservations::status.eq(terminal.as_str()),
                        reservations::released_at.eq(Some(now)),
                        reservations::updated_at.eq(now),
                    ))
                    .get_result::<Reservation>(conn)
                    .await
                    .optional()?;

                    let reservation = match updated {
                        Some(r) => r,
                        None => return Ok(None),
                    };

                    let quantity = reservation.reserved_quantity;
                    let stock_item = diesel::update(
                        stock_items::table.filter(stock_items::id.eq(reservation.stock_item_id)),
                    )
                    .set((
                        stock_items::available_quantity
                            .eq(stock_items::available_quantity + quantity),
                        stock_items::reserved_quantity
                            .eq(stock_items::reserved_quantity - quantity),
                        stock_items::updated_at.eq(now),
                    ))
                    .get_result::<StockItem>(conn)
                    .await?;

                    diesel::insert_into(outbox_messages::table)
                        .values(&event)
                        .execute(conn)
                        .await?;

                    Ok(Some(ReleaseRecord {
                        reservation,
                        stock_item,
                    }))
                })
            })
            .await?;

        Ok(record)
    }

    async fn expire_stock_batches(&self, now: DateTime<Utc>) -> StockResult<usize> {
        let mut conn = self.conn().await?;
        // RHS references evaluate against the pre-update row, so the damaged
        // bucket absorbs the available quantity before it is zeroed.
        let affected = diesel::update(
            stock_items::table.filter(
                stock_items::is_active
                    .eq(true)
                    .and(stock_items::expiry_date.le(now)),
            ),
        )
        .set((
            stock_items::damaged_quantity
                .eq(stock_items::damaged_quantity + stock_items::available_quantity),
            stock_items::available_quantity.eq(0),
            stock_items::is_active.eq(false),
            stock_items::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
        Ok(affected)
    }

    async fn recalculate_safety_stock(&self, now: DateTime<Utc>) -> StockResult<usize> {
        let mut conn = self.conn().await?;
        // minimum_level := ceil(20% of on-hand), only for items already
        // opted into safety-stock tracking.
        let affected = diesel::update(
            stock_items::table.filter(
                stock_items::is_active
                    .eq(true)
                    .and(stock_items::minimum_level.is_not_null()),
            ),
        )
        .set((
            stock_items::minimum_level.eq(diesel::dsl::sql::<
                diesel::sql_types::Nullable<diesel::sql_types::Integer>,
            >(
                "CEIL((available_quantity + reserved_quantity + in_transit_quantity) * 0.2)::int",
            )),
            stock_items::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
        Ok(affected)
    }

    async fn find_request(
        &self,
        key: &str,
        subject_id: &str,
    ) -> StockResult<Option<IdempotentRequest>> {
        let mut conn = self.conn().await?;
        let request = idempotent_requests::table
            .find((key.to_string(), subject_id.to_string()))
            .first::<IdempotentRequest>(&mut conn)
            .await
            .optional()?;
        Ok(request)
    }

    async fn try_insert_request(&self, request: NewIdempotentRequest) -> StockResult<bool> {
        let mut conn = self.conn().await?;
        match diesel::insert_into(idempotent_requests::table)
            .values(&request)
            .execute(&mut conn)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
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
        let mut conn = self.conn().await?;
        let affected = diesel::update(
            idempotent_requests::table.filter(
                idempotent_requests::key
                    .eq(key)
                    .and(idempotent_requests::subject_id.eq(subject_id))
                    .and(
                        idempotent_requests::response_body
                            .is_null()
                            .and(
                                idempotent_requests::locked_until
                                    .is_null()
                                    .or(idempotent_requests::locked_until.le(now)),
                            )
                            .or(idempotent_requests::expires_on.le(now)),
                    ),
            ),
        )
        .set((
            idempotent_requests::locked_until.eq(Some(locked_until)),
            idempotent_requests::expires_on.eq(expires_on),
            idempotent_requests::response_body.eq(None::<serde_json::Value>),
            idempotent_requests::status_code.eq(None::<i16>),
            idempotent_requests::request_hash.eq(request_hash),
        ))
        .execute(&mut conn)
        .await?;
        Ok(affected > 0)
    }

    async fn complete_request(
        &self,
        key: &str,
        subject_id: &str,
        response_body: serde_json::Value,
        status_code: i16,
    ) -> StockResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(
            idempotent_requests::table.filter(
                idempotent_requests::key
                    .eq(key)
                    .and(idempotent_requests::subject_id.eq(subject_id)),
            ),
        )
        .set((
            idempotent_requests::response_body.eq(Some(response_body)),
            idempotent_requests::status_code.eq(Some(status_code)),
            idempotent_requests::locked_until.eq(None::<DateTime<Utc>>),
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn clear_request_lock(&self, key: &str, subject_id: &str) -> StockResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(
            idempotent_requests::table.filter(
                idempotent_requests::key
                    .eq(key)
                    .and(idempotent_requests::subject_id.eq(subject_id)),
            ),
        )
        .set(idempotent_requests::locked_until.eq(None::<DateTime<Utc>>))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn append_outbox(&self, message: NewOutboxMessage) -> StockResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(outbox_messages::table)
            .values(&message)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn due_outbox_messages(
        &self,
        lease_cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StockResult<Vec<OutboxMessage>> {
        let mut conn = self.conn().await?;
        let rows = outbox_messages::table
            .filter(outbox_messages::processed.eq(false))
            .filter(
                outbox_messages::locked_at
                    .is_null()
                    .or(outbox_messages::locked_at.lt(lease_cutoff)),
            )
            .order(outbox_messages::occurred_on.asc())
            .limit(limit)
            .load::<OutboxMessage>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn try_claim_outbox(
        &self,
        id: Uuid,
        instance: &str,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> StockResult<bool> {
        let mut conn = self.conn().await?;
        let affected = diesel::update(
            outbox_messages::table.filter(
                outbox_messages::id
                    .eq(id)
                    .and(outbox_messages::processed.eq(false))
                    .and(
                        outbox_messages::locked_at
                            .is_null()
                            .or(outbox_messages::locked_at.lt(lease_cutoff)),
                    ),
            ),
        )
        .set((
            outbox_messages::locked_by.eq(Some(instance.to_string())),
            outbox_messages::locked_at.eq(Some(now)),
        ))
        .execute(&mut conn)
        .await?;
        Ok(affected > 0)
    }

    async fn mark_outbox_processed(&self, id: Uuid, now: DateTime<Utc>) -> StockResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_messages::table.filter(outbox_messages::id.eq(id)))
            .set((
                outbox_messages::processed.eq(true),
                outbox_messages::processed_on.eq(Some(now)),
                outbox_messages::locked_by.eq(None::<String>),
                outbox_messages::locked_at.eq(None::<DateTime<Utc>>),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn release_outbox_claim(&self, id: Uuid) -> StockResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_messages::table.filter(outbox_messages::id.eq(id)))
            .set((
                outbox_messages::locked_by.eq(None::<String>),
                outbox_messages::locked_at.eq(None::<DateTime<Utc>>),
                outbox_messages::retry_count.eq(outbox_messages::retry_count + 1),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_insert_inbox(&self, message: NewInboxMessage) -> StockResult<bool> {
        let mut conn = self.conn().await?;
        match diesel::insert_into(inbox_messages::table)
            .values(&message)
            .execute(&mut conn)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_inbox_message(&self, message_id: &str) -> StockResult<Option<InboxMessage>> {
        let mut conn = self.conn().await?;
        let message = inbox_messages::table
            .find(message_id.to_string())
            .first::<InboxMessage>(&mut conn)
            .await
            .optional()?;
        Ok(message)
    }

    async fn mark_inbox_processed(&self, message_id: &str, now: DateTime<Utc>) -> StockResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(inbox_messages::table.filter(inbox_messages::message_id.eq(message_id)))
            .set((
                inbox_messages::status.eq(INBOX_PROCESSED),
                inbox_messages::processed_on.eq(Some(now)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
