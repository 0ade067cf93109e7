//! Stock persistence: central and dealer rows, the ledger, the outbox, alerts and
//! the vehicle registry.
//!
//! Every stock-changing operation goes through a single `commit` of a `UnitOfWork`,
//! which writes the rows (version-checked), the ledger entries, and the outbox rows
//! atomically.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{FaultPoint, InMemoryAlertStore, InMemoryStockStore, InMemoryVehicleStore};
pub use postgres::PostgresStockStore;
pub use r#trait::{
    AlertStore, Committed, OutboxMessage, OutboxStore, StockStore, StoreError, UnitOfWork,
    VehicleStore,
};
