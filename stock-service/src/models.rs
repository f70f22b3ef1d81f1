use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "committed" => Some(ReservationStatus::Committed),
            "released" => Some(ReservationStatus::Released),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::warehouses)]
pub struct Warehouse {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stock_items)]
pub struct StockItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variation_id: Option<Uuid>,
    pub warehouse_id: Uuid,
    pub sku: Option<String>,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub in_transit_quantity: i32,
    pub damaged_quantity: i32,
    pub minimum_level: Option<i32>,
    pub maximum_level: Option<i32>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub batch_number: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::reservations)]
pub struct Reservation {
    pub id: Uuid,
    pub stock_item_id: Uuid,
    pub cart_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub reserved_quantity: i32,
    pub status: String,
    pub reservation_type: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn status(&self) -> Option<ReservationStatus> {
        ReservationStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservation {
    pub id: Uuid,
    pub stock_item_id: Uuid,
    pub cart_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub reserved_quantity: i32,
    pub status: String,
    pub reservation_type: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::idempotent_requests)]
pub struct IdempotentRequest {
    pub key: String,
    pub subject_id: String,
    pub request_hash: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub expires_on: Option<DateTime<Utc>>,
    pub response_body: Option<serde_json::Value>,
    pub status_code: Option<i16>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::idempotent_requests)]
pub struct NewIdempotentRequest {
    pub key: String,
    pub subject_id: String,
    pub request_hash: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub expires_on: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_messages)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub message_id: Uuid,
    pub event_type: String,
    pub content: serde_json::Value,
    pub destination: Option<String>,
    pub occurred_on: DateTime<Utc>,
    pub processed: bool,
    pub processed_on: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_messages)]
pub struct NewOutboxMessage {
    pub id: Uuid,
    pub message_id: Uuid,
    pub event_type: String,
    pub content: serde_json::Value,
    pub destination: Option<String>,
    pub occurred_on: DateTime<Utc>,
}

impl NewOutboxMessage {
    pub fn new(event_type: &str, content: serde_json::Value, occurred_on: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            content,
            destination: None,
            occurred_on,
        }
    }
}

pub const INBOX_RECEIVED: &str = "received";
pub const INBOX_PROCESSED: &str = "processed";

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inbox_messages)]
pub struct InboxMessage {
    pub message_id: String,
    pub message_type: String,
    pub content: serde_json::Value,
    pub consumer: Option<String>,
    pub status: String,
    pub received_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inbox_messages)]
pub struct NewInboxMessage {
    pub message_id: String,
    pub message_type: String,
    pub content: serde_json::Value,
    pub consumer: Option<String>,
    pub status: String,
    pub received_at: DateTime<Utc>,
}
