use thiserror::Error;

/// Failure taxonomy for the commitment core.
///
/// `Validation`, `NotFound` and the conflict variants are caller-actionable
/// and never retried automatically. `Store` and `Publish` are infrastructure
/// failures; background loops retry them on their own cadence.
#[derive(Debug, Error)]
pub enum StockError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i32, requested: i32 },

    #[error("idempotency key re-used with a different request payload")]
    KeyPayloadMismatch,

    #[error("an operation with this idempotency key is already in progress")]
    OperationInProgress,

    #[error("reservation is no longer pending")]
    InvalidState,

    #[error("store error: {0}")]
    Store(String),

    #[error("publish error: {0}")]
    Publish(String),
}

impl StockError {
    /// Conflicts a client can resolve by inspecting its own state, as opposed
    /// to requests it must change before retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StockError::InsufficientStock { .. }
                | StockError::KeyPayloadMismatch
                | StockError::OperationInProgress
                | StockError::InvalidState
        )
    }
}

impl From<diesel::result::Error> for StockError {
    fn from(e: diesel::result::Error) -> Self {
        StockError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for StockError {
    fn from(e: serde_json::Error) -> Self {
        StockError::Validation(format!("payload serialization: {}", e))
    }
}

pub type StockResult<T> = Result<T, StockError>;
