//! Inventory allocation domain.
//!
//! Pure, deterministic rules for central and dealer stock, the transaction
//! ledger, reorder alerts and the events the core publishes (no IO, no storage).

pub mod alert;
pub mod directory;
pub mod event;
pub mod movement;
pub mod status;
pub mod stock;
pub mod transaction;
pub mod vehicle;

pub use alert::{AlertCandidate, AlertStatus, AlertType, StockAlert};
pub use directory::{Catalog, DealerDirectory, DealerInfo, VariantInfo};
pub use event::{OrderApproved, OrderLine, StockLevelChanged};
pub use movement::{plan, replay, Replayed, StockChange};
pub use status::{
    DealerStockView, InventoryFilter, InventoryStatusView, Page, Paged, ReconciliationReport,
};
pub use stock::{CentralStock, DealerAllocation};
pub use transaction::{
    ledger_net_total, InventoryTransaction, StockScope, TransactionRequest, TransactionType,
};
pub use vehicle::{PhysicalVehicle, TransferRequest, TransferStatus, VehicleStatus, Vin};
