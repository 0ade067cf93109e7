use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use stockledger_core::{AlertId, DealerId, StaffId, TransactionId, VariantId};
use stockledger_infra::{AllocationOutcome, AppliedTransaction, ScanReport};
use stockledger_inventory::status::DEFAULT_PAGE_SIZE;
use stockledger_inventory::{
    AlertStatus, CentralStock, DealerAllocation, InventoryFilter, InventoryTransaction, OrderLine,
    Page, ReconciliationReport, StockAlert, StockScope, TransactionRequest, TransactionType, Vin,
};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /transactions`; the acting staff member comes from the request context.
#[derive(Debug, Deserialize)]
pub struct ApplyTransactionRequest {
    pub transaction_type: TransactionType,
    pub variant_id: VariantId,
    pub quantity: i64,
    #[serde(default)]
    pub from_dealer_id: Option<DealerId>,
    #[serde(default)]
    pub to_dealer_id: Option<DealerId>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ApplyTransactionRequest {
    pub fn into_request(self, staff_id: StaffId) -> TransactionRequest {
        TransactionRequest {
            transaction_type: self.transaction_type,
            variant_id: self.variant_id,
            quantity: self.quantity,
            from_dealer_id: self.from_dealer_id,
            to_dealer_id: self.to_dealer_id,
            staff_id,
            reference_id: self.reference_id,
            notes: self.notes,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct InventoryListQuery {
    pub dealer_id: Option<DealerId>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl InventoryListQuery {
    pub fn filter(&self) -> InventoryFilter {
        InventoryFilter {
            dealer_id: self.dealer_id,
            status: self.status.clone(),
            search: self.search.clone(),
        }
    }

    pub fn page(&self) -> Page {
        page(self.offset, self.limit)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl PageQuery {
    pub fn page(&self) -> Page {
        page(self.offset, self.limit)
    }
}

fn page(offset: Option<usize>, limit: Option<usize>) -> Page {
    Page::new(offset.unwrap_or(0), limit.unwrap_or(DEFAULT_PAGE_SIZE))
}

/// Central threshold when `dealer_id` is absent.
#[derive(Debug, Deserialize)]
pub struct UpdateReorderLevelRequest {
    #[serde(default)]
    pub dealer_id: Option<DealerId>,
    pub reorder_level: i64,
}

impl UpdateReorderLevelRequest {
    pub fn scope(&self) -> StockScope {
        StockScope::from_dealer(self.dealer_id)
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateDealerStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct AllocateOrderRequest {
    pub items: Vec<OrderLine>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertListQuery {
    /// NEW, ACKNOWLEDGED or RESOLVED; active alerts when absent.
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReceiveVehiclesRequest {
    pub variant_id: VariantId,
    pub vins: Vec<Vin>,
}

/// One side must be the central warehouse (no dealer id).
#[derive(Debug, Deserialize)]
pub struct CreateTransferRequest {
    pub variant_id: VariantId,
    #[serde(default)]
    pub from_dealer_id: Option<DealerId>,
    #[serde(default)]
    pub to_dealer_id: Option<DealerId>,
    pub vins: Vec<Vin>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertVariantRequest {
    pub model_name: String,
    pub variant_name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpsertDealerRequest {
    pub name: String,
    pub region: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct AppliedTransactionResponse {
    pub transaction_id: TransactionId,
    pub transaction: InventoryTransaction,
    pub central: Option<StockRow>,
    pub dealer: Option<StockRow>,
}

impl From<AppliedTransaction> for AppliedTransactionResponse {
    fn from(value: AppliedTransaction) -> Self {
        Self {
            transaction_id: value.transaction_id(),
            transaction: value.transaction,
            central: value.central.as_ref().map(StockRow::from),
            dealer: value.dealer.as_ref().map(StockRow::from),
        }
    }
}

/// Levels of one central or dealer row after a write.
#[derive(Debug, Serialize)]
pub struct StockRow {
    pub variant_id: VariantId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dealer_id: Option<DealerId>,
    pub allocated_quantity: i64,
    pub available_quantity: i64,
    pub reorder_level: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_imported: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl From<&CentralStock> for StockRow {
    fn from(row: &CentralStock) -> Self {
        Self {
            variant_id: row.variant_id(),
            dealer_id: None,
            allocated_quantity: row.allocated_quantity(),
            available_quantity: row.available_quantity(),
            reorder_level: row.reorder_level(),
            total_imported: Some(row.total_imported()),
            status: None,
        }
    }
}

impl From<&DealerAllocation> for StockRow {
    fn from(row: &DealerAllocation) -> Self {
        Self {
            variant_id: row.variant_id(),
            dealer_id: Some(row.dealer_id()),
            allocated_quantity: row.allocated_quantity(),
            available_quantity: row.available_quantity(),
            reorder_level: row.reorder_level(),
            total_imported: None,
            status: Some(row.status().to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AllocationResponse {
    pub order_id: String,
    /// True when the order had been allocated before; nothing was reserved this time.
    pub already_allocated: bool,
    pub transactions: Vec<InventoryTransaction>,
}

impl AllocationResponse {
    pub fn new(order_id: String, outcome: AllocationOutcome) -> Self {
        let already_allocated = matches!(outcome, AllocationOutcome::AlreadyAllocated(_));
        let transactions = match outcome {
            AllocationOutcome::Allocated(t) | AllocationOutcome::AlreadyAllocated(t) => t,
        };
        Self {
            order_id,
            already_allocated,
            transactions,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReconciliationResponse {
    pub consistent: bool,
    #[serde(flatten)]
    pub report: ReconciliationReport,
}

impl From<ReconciliationReport> for ReconciliationResponse {
    fn from(report: ReconciliationReport) -> Self {
        Self {
            consistent: report.is_consistent(),
            report,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub variants_scanned: usize,
    pub candidates: usize,
    pub already_open: usize,
    pub opened: Vec<StockAlert>,
    pub failed: Vec<VariantId>,
}

impl From<ScanReport> for ScanResponse {
    fn from(report: ScanReport) -> Self {
        Self {
            variants_scanned: report.variants_scanned,
            candidates: report.candidates,
            already_open: report.already_open,
            opened: report.opened,
            failed: report.failed,
        }
    }
}

// -------------------------
// Path / query parsing
// -------------------------

pub fn parse_variant_id(raw: &str) -> Result<VariantId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid variant id"))
}

pub fn parse_dealer_id(raw: &str) -> Result<DealerId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid dealer id"))
}

pub fn parse_alert_id(raw: &str) -> Result<AlertId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid alert id"))
}

pub fn parse_vin(raw: &str) -> Result<Vin, axum::response::Response> {
    Vin::parse(raw).map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

pub fn parse_transfer_id(raw: &str) -> Result<uuid::Uuid, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid transfer id"))
}

pub fn parse_alert_status(raw: &str) -> Result<AlertStatus, axum::response::Response> {
    raw.parse().map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: NEW, ACKNOWLEDGED, RESOLVED",
        )
    })
}
