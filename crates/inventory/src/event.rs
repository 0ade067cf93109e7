//! Integration events published or consumed by the inventory core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{OrderId, StaffId, TransactionId, VariantId};
use stockledger_events::Event;

use crate::stock::{CentralStock, DealerAllocation};
use crate::transaction::{StockScope, TransactionType};

pub const STOCK_LEVEL_CHANGED: &str = "inventory.stock.level_changed";
pub const ORDER_APPROVED: &str = "orders.order.approved";

/// New absolute stock levels of one (variant, scope) key after a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevelChanged {
    pub variant_id: VariantId,
    pub scope: StockScope,
    pub allocated_quantity: i64,
    pub available_quantity: i64,
    /// Only present for the central scope.
    #[serde(default)]
    pub total_imported: Option<i64>,
    /// Highest ledger position that produced this state.
    pub transaction_id: TransactionId,
    pub transaction_type: TransactionType,
    pub occurred_at: DateTime<Utc>,
}

impl StockLevelChanged {
    pub fn for_central(
        row: &CentralStock,
        transaction_id: TransactionId,
        transaction_type: TransactionType,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            variant_id: row.variant_id(),
            scope: StockScope::Central,
            allocated_quantity: row.allocated_quantity(),
            available_quantity: row.available_quantity(),
            total_imported: Some(row.total_imported()),
            transaction_id,
            transaction_type,
            occurred_at,
        }
    }

    pub fn for_dealer(
        row: &DealerAllocation,
        transaction_id: TransactionId,
        transaction_type: TransactionType,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            variant_id: row.variant_id(),
            scope: StockScope::Dealer(row.dealer_id()),
            allocated_quantity: row.allocated_quantity(),
            available_quantity: row.available_quantity(),
            total_imported: None,
            transaction_id,
            transaction_type,
            occurred_at,
        }
    }
}

impl Event for StockLevelChanged {
    fn event_type(&self) -> &'static str {
        STOCK_LEVEL_CHANGED
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn partition_key(&self) -> String {
        self.variant_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub variant_id: VariantId,
    pub quantity: i64,
}

/// Inbound: an order was approved and its units should be reserved centrally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderApproved {
    pub order_id: OrderId,
    pub items: Vec<OrderLine>,
    pub approved_by: StaffId,
    pub occurred_at: DateTime<Utc>,
}

impl Event for OrderApproved {
    fn event_type(&self) -> &'static str {
        ORDER_APPROVED
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn partition_key(&self) -> String {
        self.order_id.to_string()
    }
}
