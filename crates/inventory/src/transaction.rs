//! Stock transaction requests and immutable ledger entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DealerId, DomainError, DomainResult, StaffId, TransactionId, VariantId};

/// Kind of stock movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    InitialStock,
    Restock,
    TransferToDealer,
    TransferToCentral,
    Sale,
    AdjustmentAdd,
    AdjustmentSubtract,
    Allocate,
}

impl TransactionType {
    pub const ALL: [TransactionType; 8] = [
        TransactionType::InitialStock,
        TransactionType::Restock,
        TransactionType::TransferToDealer,
        TransactionType::TransferToCentral,
        TransactionType::Sale,
        TransactionType::AdjustmentAdd,
        TransactionType::AdjustmentSubtract,
        TransactionType::Allocate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::InitialStock => "INITIAL_STOCK",
            TransactionType::Restock => "RESTOCK",
            TransactionType::TransferToDealer => "TRANSFER_TO_DEALER",
            TransactionType::TransferToCentral => "TRANSFER_TO_CENTRAL",
            TransactionType::Sale => "SALE",
            TransactionType::AdjustmentAdd => "ADJUSTMENT_ADD",
            TransactionType::AdjustmentSubtract => "ADJUSTMENT_SUBTRACT",
            TransactionType::Allocate => "ALLOCATE",
        }
    }

    /// Net change this movement makes to the units held anywhere in the system.
    ///
    /// Transfers and allocations only move units between buckets.
    pub fn system_delta(&self, quantity: i64) -> i64 {
        match self {
            TransactionType::InitialStock
            | TransactionType::Restock
            | TransactionType::AdjustmentAdd => quantity,
            TransactionType::Sale | TransactionType::AdjustmentSubtract => -quantity,
            TransactionType::TransferToDealer
            | TransactionType::TransferToCentral
            | TransactionType::Allocate => 0,
        }
    }
}

impl core::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TransactionType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        TransactionType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| DomainError::validation(format!("unknown transaction type '{s}'")))
    }
}

/// Which stock bucket a row or alert refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "dealer_id", rename_all = "snake_case")]
pub enum StockScope {
    Central,
    Dealer(DealerId),
}

impl StockScope {
    pub fn dealer_id(&self) -> Option<DealerId> {
        match self {
            StockScope::Central => None,
            StockScope::Dealer(d) => Some(*d),
        }
    }

    pub fn from_dealer(dealer_id: Option<DealerId>) -> Self {
        dealer_id.map_or(StockScope::Central, StockScope::Dealer)
    }
}

impl core::fmt::Display for StockScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StockScope::Central => f.write_str("central"),
            StockScope::Dealer(d) => write!(f, "dealer {d}"),
        }
    }
}

/// Inbound request to move stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub transaction_type: TransactionType,
    pub variant_id: VariantId,
    pub quantity: i64,
    #[serde(default)]
    pub from_dealer_id: Option<DealerId>,
    #[serde(default)]
    pub to_dealer_id: Option<DealerId>,
    pub staff_id: StaffId,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl TransactionRequest {
    pub fn new(
        transaction_type: TransactionType,
        variant_id: VariantId,
        quantity: i64,
        staff_id: StaffId,
    ) -> Self {
        Self {
            transaction_type,
            variant_id,
            quantity,
            from_dealer_id: None,
            to_dealer_id: None,
            staff_id,
            reference_id: None,
            notes: None,
        }
    }

    pub fn from_dealer(mut self, dealer_id: DealerId) -> Self {
        self.from_dealer_id = Some(dealer_id);
        self
    }

    pub fn to_dealer(mut self, dealer_id: DealerId) -> Self {
        self.to_dealer_id = Some(dealer_id);
        self
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Structural checks that need no stored state.
    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "quantity must be positive (got {})",
                self.quantity
            )));
        }

        let (from, to) = (self.from_dealer_id, self.to_dealer_id);
        let kind = self.transaction_type;
        match kind {
            TransactionType::InitialStock | TransactionType::Restock | TransactionType::Allocate => {
                if from.is_some() || to.is_some() {
                    return Err(DomainError::validation(format!(
                        "{kind} is a central warehouse operation and takes no dealer id"
                    )));
                }
            }
            TransactionType::TransferToDealer => {
                if to.is_none() {
                    return Err(DomainError::validation("TRANSFER_TO_DEALER requires to_dealer_id"));
                }
                if from.is_some() {
                    return Err(DomainError::validation(
                        "TRANSFER_TO_DEALER must not carry from_dealer_id",
                    ));
                }
            }
            TransactionType::TransferToCentral | TransactionType::Sale => {
                if from.is_none() {
                    return Err(DomainError::validation(format!("{kind} requires from_dealer_id")));
                }
                if to.is_some() {
                    return Err(DomainError::validation(format!(
                        "{kind} must not carry to_dealer_id"
                    )));
                }
            }
            TransactionType::AdjustmentAdd | TransactionType::AdjustmentSubtract => {
                if from.is_some() && to.is_some() {
                    return Err(DomainError::validation(format!(
                        "{kind} targets a single side; pass at most one dealer id"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Dealer row touched by this request, if any.
    pub fn dealer_id(&self) -> Option<DealerId> {
        self.from_dealer_id.or(self.to_dealer_id)
    }

    /// Whether the central row for the variant is touched.
    pub fn touches_central(&self) -> bool {
        match self.transaction_type {
            TransactionType::Sale => false,
            TransactionType::AdjustmentAdd | TransactionType::AdjustmentSubtract => {
                self.dealer_id().is_none()
            }
            _ => true,
        }
    }

    /// Stock scopes whose quantities change when this request is applied.
    pub fn affected_scopes(&self) -> Vec<StockScope> {
        let mut scopes = Vec::with_capacity(2);
        if self.touches_central() {
            scopes.push(StockScope::Central);
        }
        if let Some(d) = self.dealer_id() {
            scopes.push(StockScope::Dealer(d));
        }
        scopes
    }
}

/// Immutable ledger entry (one per applied transaction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTransaction {
    pub transaction_id: TransactionId,
    pub variant_id: VariantId,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub from_dealer_id: Option<DealerId>,
    pub to_dealer_id: Option<DealerId>,
    pub transaction_date: DateTime<Utc>,
    pub staff_id: StaffId,
    pub reference_id: Option<String>,
    pub notes: Option<String>,
}

impl InventoryTransaction {
    /// Materialize a validated request into a ledger entry at its assigned position.
    pub fn record(
        transaction_id: TransactionId,
        request: TransactionRequest,
        transaction_date: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id,
            variant_id: request.variant_id,
            transaction_type: request.transaction_type,
            quantity: request.quantity,
            from_dealer_id: request.from_dealer_id,
            to_dealer_id: request.to_dealer_id,
            transaction_date,
            staff_id: request.staff_id,
            reference_id: request.reference_id,
            notes: request.notes,
        }
    }

    pub fn system_delta(&self) -> i64 {
        self.transaction_type.system_delta(self.quantity)
    }

    /// Whether this entry changed the given bucket of its variant.
    pub fn touches(&self, scope: StockScope) -> bool {
        let dealer = self.from_dealer_id.or(self.to_dealer_id);
        match scope {
            StockScope::Dealer(d) => dealer == Some(d),
            StockScope::Central => match self.transaction_type {
                TransactionType::Sale => false,
                TransactionType::AdjustmentAdd | TransactionType::AdjustmentSubtract => {
                    dealer.is_none()
                }
                _ => true,
            },
        }
    }
}

/// Net units the ledger says should exist for a variant.
pub fn ledger_net_total<'a>(entries: impl IntoIterator<Item = &'a InventoryTransaction>) -> i64 {
    entries.into_iter().map(InventoryTransaction::system_delta).sum()
}
