use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use stockledger_core::{AlertId, DealerId, TransactionId, VariantId};
use stockledger_events::EventEnvelope;
use stockledger_inventory::{
    AlertCandidate, AlertStatus, CentralStock, DealerAllocation, InventoryTransaction,
    PhysicalVehicle, StockAlert, StockLevelChanged, StockScope, TransactionRequest,
    TransferRequest, Vin,
};

/// Storage-level error.
///
/// These are infrastructure failures and write conflicts, as opposed to domain
/// errors (validation, insufficient stock) which never reach the store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A version-checked write found a different version (or an unexpected row).
    #[error("concurrent modification: {0}")]
    Conflict(String),

    /// The unit of work's idempotency key was already committed.
    #[error("idempotency key already applied: {0}")]
    Duplicate(String),

    /// A stored row could not be decoded or breaks a row invariant.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    /// Referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend unavailable or failed mid-operation; nothing was committed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Backend(_))
    }
}

/// Everything one stock-changing operation writes, committed all-or-nothing.
///
/// Rows carry the version they were loaded at; the store rejects the commit with
/// `StoreError::Conflict` if any of them moved in the meantime.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    pub centrals: Vec<CentralStock>,
    pub dealers: Vec<DealerAllocation>,
    pub entries: Vec<TransactionRequest>,
    /// Rejects a second commit with the same key (redelivered orders).
    pub idempotency_key: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.centrals.is_empty() && self.dealers.is_empty() && self.entries.is_empty()
    }

    /// Ledger records for the entries, numbered from the ids the store assigned.
    pub fn records(&self, ids: &[TransactionId], at: DateTime<Utc>) -> Vec<InventoryTransaction> {
        self.entries
            .iter()
            .zip(ids)
            .map(|(req, id)| InventoryTransaction::record(*id, req.clone(), at))
            .collect()
    }
}

/// Result of a successful commit: the ledger records and the rows as now stored.
#[derive(Debug, Clone, Default)]
pub struct Committed {
    pub transactions: Vec<InventoryTransaction>,
    pub centrals: Vec<CentralStock>,
    pub dealers: Vec<DealerAllocation>,
}

impl Committed {
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.iter().map(|t| t.transaction_id).collect()
    }
}

/// Pending integration event written alongside the stock rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub outbox_id: u64,
    pub envelope: EventEnvelope<JsonValue>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Stock-level events for every written row touched by a ledger entry.
///
/// The envelope sequence is the highest ledger position touching that row, which is
/// what downstream consumers use to discard stale redeliveries.
pub fn outbox_envelopes(
    centrals: &[CentralStock],
    dealers: &[DealerAllocation],
    records: &[InventoryTransaction],
    at: DateTime<Utc>,
) -> Result<Vec<EventEnvelope<JsonValue>>, StoreError> {
    let latest = |variant_id: VariantId, scope: StockScope| {
        records
            .iter()
            .filter(|r| r.variant_id == variant_id && r.touches(scope))
            .max_by_key(|r| r.transaction_id)
    };

    let mut events = Vec::new();
    for row in centrals {
        if let Some(r) = latest(row.variant_id(), StockScope::Central) {
            events.push(StockLevelChanged::for_central(row, r.transaction_id, r.transaction_type, at));
        }
    }
    for row in dealers {
        if let Some(r) = latest(row.variant_id(), StockScope::Dealer(row.dealer_id())) {
            events.push(StockLevelChanged::for_dealer(row, r.transaction_id, r.transaction_type, at));
        }
    }

    events
        .iter()
        .map(|e| {
            EventEnvelope::from_typed(Uuid::now_v7(), e.transaction_id.get(), e)
                .map_err(|err| StoreError::Corrupt(format!("outbox payload serialization failed: {err}")))
        })
        .collect()
}

/// Unit-of-work store for stock rows and the ledger.
///
/// Implementations must:
/// - apply every row write, ledger append and outbox insert of a commit atomically
/// - reject a commit when any row's stored version differs from the loaded one
/// - assign strictly increasing transaction ids
/// - reject a commit whose idempotency key was already committed
pub trait StockStore: Send + Sync {
    fn load_central(&self, variant_id: VariantId) -> Result<Option<CentralStock>, StoreError>;

    fn load_dealer(
        &self,
        dealer_id: DealerId,
        variant_id: VariantId,
    ) -> Result<Option<DealerAllocation>, StoreError>;

    /// All dealer rows of a variant, ordered by dealer id.
    fn dealer_allocations(&self, variant_id: VariantId) -> Result<Vec<DealerAllocation>, StoreError>;

    /// Every variant that has a central or dealer row, ascending.
    fn variant_ids(&self) -> Result<Vec<VariantId>, StoreError>;

    fn commit(&self, uow: UnitOfWork) -> Result<Committed, StoreError>;

    /// Ledger entries of a variant in transaction order.
    fn ledger(&self, variant_id: VariantId) -> Result<Vec<InventoryTransaction>, StoreError>;

    /// Ledger entries carrying the given reference id.
    fn ledger_by_reference(&self, reference_id: &str) -> Result<Vec<InventoryTransaction>, StoreError>;
}

/// Durable queue of events awaiting publication.
pub trait OutboxStore: Send + Sync {
    /// Oldest unpublished messages first.
    fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError>;

    fn mark_published(&self, outbox_id: u64, at: DateTime<Utc>) -> Result<(), StoreError>;

    fn record_failure(&self, outbox_id: u64, error: &str) -> Result<(), StoreError>;

    /// Every message with an id above `after_id`, published or not, in id order.
    ///
    /// Used to rebuild read models that do not survive a restart.
    fn history(&self, after_id: u64, limit: usize) -> Result<Vec<OutboxMessage>, StoreError>;
}

/// Alert persistence with the at-most-one-open-alert-per-key rule.
pub trait AlertStore: Send + Sync {
    fn find_open(&self, variant_id: VariantId, scope: StockScope) -> Result<Option<StockAlert>, StoreError>;

    /// Insert a NEW alert unless one is already open for the key (checked atomically).
    ///
    /// Returns `None` when an open alert already existed.
    fn open_if_absent(
        &self,
        candidate: &AlertCandidate,
        at: DateTime<Utc>,
    ) -> Result<Option<StockAlert>, StoreError>;

    fn get(&self, alert_id: AlertId) -> Result<Option<StockAlert>, StoreError>;

    /// Alerts with the given status, or all alerts when `None`, oldest first.
    fn list(&self, status: Option<AlertStatus>) -> Result<Vec<StockAlert>, StoreError>;

    /// Persist a status change if the alert is still in `expected`.
    ///
    /// The caller has already validated `expected -> status`. Returns
    /// `StoreError::Conflict` when another writer changed the status first.
    fn update_status(
        &self,
        alert_id: AlertId,
        expected: AlertStatus,
        status: AlertStatus,
    ) -> Result<StockAlert, StoreError>;
}

/// Physical vehicles and their transfer requests.
pub trait VehicleStore: Send + Sync {
    fn load_vehicle(&self, vin: &Vin) -> Result<Option<PhysicalVehicle>, StoreError>;

    fn load_request(&self, request_id: Uuid) -> Result<Option<TransferRequest>, StoreError>;

    /// Whether a non-terminal transfer request includes the vehicle.
    fn is_reserved(&self, vin: &Vin) -> Result<bool, StoreError>;

    /// Upsert the vehicles and, if given, the request in one atomic write.
    fn save(
        &self,
        vehicles: &[PhysicalVehicle],
        request: Option<&TransferRequest>,
    ) -> Result<(), StoreError>;
}

impl<S: StockStore + ?Sized> StockStore for Arc<S> {
    fn load_central(&self, variant_id: VariantId) -> Result<Option<CentralStock>, StoreError> {
        (**self).load_central(variant_id)
    }

    fn load_dealer(
        &self,
        dealer_id: DealerId,
        variant_id: VariantId,
    ) -> Result<Option<DealerAllocation>, StoreError> {
        (**self).load_dealer(dealer_id, variant_id)
    }

    fn dealer_allocations(&self, variant_id: VariantId) -> Result<Vec<DealerAllocation>, StoreError> {
        (**self).dealer_allocations(variant_id)
    }

    fn variant_ids(&self) -> Result<Vec<VariantId>, StoreError> {
        (**self).variant_ids()
    }

    fn commit(&self, uow: UnitOfWork) -> Result<Committed, StoreError> {
        (**self).commit(uow)
    }

    fn ledger(&self, variant_id: VariantId) -> Result<Vec<InventoryTransaction>, StoreError> {
        (**self).ledger(variant_id)
    }

    fn ledger_by_reference(&self, reference_id: &str) -> Result<Vec<InventoryTransaction>, StoreError> {
        (**self).ledger_by_reference(reference_id)
    }
}

impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        (**self).pending(limit)
    }

    fn mark_published(&self, outbox_id: u64, at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).mark_published(outbox_id, at)
    }

    fn record_failure(&self, outbox_id: u64, error: &str) -> Result<(), StoreError> {
        (**self).record_failure(outbox_id, error)
    }

    fn history(&self, after_id: u64, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        (**self).history(after_id, limit)
    }
}

impl<S: AlertStore + ?Sized> AlertStore for Arc<S> {
    fn find_open(&self, variant_id: VariantId, scope: StockScope) -> Result<Option<StockAlert>, StoreError> {
        (**self).find_open(variant_id, scope)
    }

    fn open_if_absent(
        &self,
        candidate: &AlertCandidate,
        at: DateTime<Utc>,
    ) -> Result<Option<StockAlert>, StoreError> {
        (**self).open_if_absent(candidate, at)
    }

    fn get(&self, alert_id: AlertId) -> Result<Option<StockAlert>, StoreError> {
        (**self).get(alert_id)
    }

    fn list(&self, status: Option<AlertStatus>) -> Result<Vec<StockAlert>, StoreError> {
        (**self).list(status)
    }

    fn update_status(
        &self,
        alert_id: AlertId,
        expected: AlertStatus,
        status: AlertStatus,
    ) -> Result<StockAlert, StoreError> {
        (**self).update_status(alert_id, expected, status)
    }
}

impl<S: VehicleStore + ?Sized> VehicleStore for Arc<S> {
    fn load_vehicle(&self, vin: &Vin) -> Result<Option<PhysicalVehicle>, StoreError> {
        (**self).load_vehicle(vin)
    }

    fn load_request(&self, request_id: Uuid) -> Result<Option<TransferRequest>, StoreError> {
        (**self).load_request(request_id)
    }

    fn is_reserved(&self, vin: &Vin) -> Result<bool, StoreError> {
        (**self).is_reserved(vin)
    }

    fn save(
        &self,
        vehicles: &[PhysicalVehicle],
        request: Option<&TransferRequest>,
    ) -> Result<(), StoreError> {
        (**self).save(vehicles, request)
    }
}
