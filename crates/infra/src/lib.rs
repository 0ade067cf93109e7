//! Infrastructure layer: stores, the transaction applier, background workers and config.

pub mod alerts;
pub mod applier;
pub mod config;
pub mod directory;
pub mod event_bus;
pub mod listeners;
pub mod projections;
pub mod query;
pub mod read_model;
pub mod retry;
pub mod store;
pub mod transfers;
pub mod workers;

pub use alerts::{AlertError, ScanReport, StockAlertEngine};
pub use applier::{AllocationOutcome, AppliedTransaction, ApplyError, TransactionApplier};
pub use config::Settings;
pub use query::{QueryError, StockQueryService};
pub use retry::RetryPolicy;
pub use transfers::{TransferError, TransferService};
