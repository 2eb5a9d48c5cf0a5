pub mod api;
pub mod checkout;
pub mod holdings;
pub mod lending;
pub mod models;
pub mod reservations;
pub mod returns;
pub mod schema;
pub mod stock;
pub mod store;
pub mod telemetry;

pub use lending::Lending;
pub use store::{LendingStore, LockScope, MemoryStore, PgStore, StoreTx};
