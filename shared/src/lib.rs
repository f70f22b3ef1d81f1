use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockCommand {
    pub id: Uuid,
    pub command_type: StockCommandType,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommandType {
    ReserveStock,
    CommitReservation,
    ReleaseReservation,
    ReleaseCartReservations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: Uuid,
    pub command_id: Uuid,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveStockData {
    pub product_id: Uuid,
    pub variation_id: Option<Uuid>,
    pub warehouse_id: Option<Uuid>,
    pub cart_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub quantity: i32,
    pub reservation_type: ReservationKind,
    pub ttl_minutes: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationKind {
    Cart,
    Order,
    PreOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReservationData {
    pub reservation_id: Uuid,
    pub order_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReservationData {
    pub reservation_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseCartReservationsData {
    pub cart_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveStockResult {
    pub reservation_id: Uuid,
    pub stock_item_id: Uuid,
    pub reserved_quantity: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub message: String,
}

// Stable wire identifiers for outbox event types.
pub const EVENT_STOCK_RESERVED: &str = "Stock.Reserved";
pub const EVENT_STOCK_COMMITTED: &str = "Stock.Committed";
pub const EVENT_STOCK_RELEASED: &str = "Stock.Released";
pub const EVENT_LOW_STOCK_ALERT: &str = "Stock.LowStockAlert";
pub const EVENT_OUT_OF_STOCK: &str = "Stock.OutOfStock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReserved {
    pub reservation_id: Uuid,
    pub product_id: Uuid,
    pub variation_id: Option<Uuid>,
    pub stock_item_id: Uuid,
    pub quantity: i32,
    pub cart_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockCommitted {
    pub reservation_id: Uuid,
    pub order_id: Uuid,
    pub stock_item_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReleased {
    pub reservation_id: Uuid,
    pub stock_item_id: Uuid,
    pub quantity: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub stock_item_id: Uuid,
    pub product_id: Uuid,
    pub warehouse_id: Uuid,
    pub available_quantity: i32,
    pub minimum_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutOfStock {
    pub stock_item_id: Uuid,
    pub product_id: Uuid,
    pub warehouse_id: Uuid,
}

impl StockCommand {
    pub fn new(command_type: StockCommandType, payload: serde_json::Value) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            command_type,
            payload,
            idempotency_key: format!("{}_{}", id, Uuid::new_v4()),
            created_at: Utc::now(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }
}

impl CommandReply {
    pub fn success(command_id: Uuid, result: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            status: CommandStatus::Success,
            result,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(command_id: Uuid, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            status: CommandStatus::Failed,
            result: None,
            error: Some(error),
            created_at: Utc::now(),
        }
    }
}
