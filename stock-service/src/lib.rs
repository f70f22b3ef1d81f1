//! Inventory commitment core: stock reservation and allocation across
//! warehouses, idempotent command execution, and reliable event delivery via
//! the transactional outbox/inbox pattern.

pub mod allocation;
pub mod api;
pub mod clock;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod inbox;
pub mod models;
pub mod outbox;
pub mod reaper;
pub mod reservation;
pub mod schema;
pub mod store;
