//! Transaction applier: validate, plan against stored rows, commit atomically.
//!
//! ```text
//! TransactionRequest(s)
//!   ↓
//! 1. Validate structure (quantity, dealer direction)
//!   ↓
//! 2. Load the touched rows (central and/or dealer, with versions)
//!   ↓
//! 3. Plan the new row state (pure movement rules, stock sufficiency)
//!   ↓
//! 4. Commit rows + ledger entries + outbox rows as one unit of work
//!   ↓
//! 5. On a version conflict, reload and retry with backoff (bounded)
//! ```
//!
//! Request handlers and bus listeners both come through here, so concurrent
//! callers on the same key are serialized by the store's version check.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use stockledger_core::{DealerId, DomainError, OrderId, StaffId, TransactionId, VariantId};
use stockledger_inventory::{
    plan, CentralStock, DealerAllocation, InventoryTransaction, OrderLine, StockScope,
    TransactionRequest, TransactionType,
};

use crate::retry::RetryPolicy;
use crate::store::{Committed, StockStore, StoreError, UnitOfWork};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Rejected before any state was touched.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient stock in {scope}: requested {requested}, available {available}")]
    InsufficientStock {
        scope: String,
        requested: i64,
        available: i64,
    },

    #[error("unknown reference: {0}")]
    UnknownReference(String),

    /// Version conflicts persisted through every retry; the request may be retried later.
    #[error("concurrent modification after {attempts} attempt(s): {message}")]
    ConcurrentModification { attempts: u32, message: String },

    /// The idempotency key was already committed.
    #[error("already applied: {0}")]
    AlreadyApplied(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Store(StoreError),
}

impl ApplyError {
    /// Whether the caller may retry the whole request later.
    pub fn is_transient(&self) -> bool {
        match self {
            ApplyError::ConcurrentModification { .. } => true,
            ApplyError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<DomainError> for ApplyError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => ApplyError::Validation(msg),
            DomainError::InsufficientStock {
                scope,
                requested,
                available,
            } => ApplyError::InsufficientStock {
                scope,
                requested,
                available,
            },
            DomainError::UnknownReference(msg) => ApplyError::UnknownReference(msg),
            DomainError::InvariantViolation(msg) => ApplyError::InvariantViolation(msg),
            DomainError::Conflict(msg) => ApplyError::ConcurrentModification {
                attempts: 1,
                message: msg,
            },
            DomainError::NotFound => ApplyError::UnknownReference("not found".to_string()),
        }
    }
}

impl From<StoreError> for ApplyError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(message) => ApplyError::ConcurrentModification {
                attempts: 1,
                message,
            },
            StoreError::Duplicate(key) => ApplyError::AlreadyApplied(key),
            other => ApplyError::Store(other),
        }
    }
}

/// One committed ledger entry and the rows as they now stand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransaction {
    pub transaction: InventoryTransaction,
    pub central: Option<CentralStock>,
    pub dealer: Option<DealerAllocation>,
}

impl AppliedTransaction {
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.transaction_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    Allocated(Vec<InventoryTransaction>),
    /// The order was allocated by an earlier delivery; these are its ledger entries.
    AlreadyAllocated(Vec<InventoryTransaction>),
}

impl AllocationOutcome {
    pub fn transactions(&self) -> &[InventoryTransaction] {
        match self {
            AllocationOutcome::Allocated(t) | AllocationOutcome::AlreadyAllocated(t) => t,
        }
    }
}

/// Idempotency key used for an order's allocation.
pub fn order_idempotency_key(order_id: &OrderId) -> String {
    format!("order:{order_id}")
}

#[derive(Debug)]
pub struct TransactionApplier<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S> TransactionApplier<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: StockStore> TransactionApplier<S> {
    /// Apply one stock transaction.
    #[instrument(
        skip(self, request),
        fields(
            variant_id = %request.variant_id,
            transaction_type = %request.transaction_type,
            quantity = request.quantity
        ),
        err
    )]
    pub fn apply(&self, request: TransactionRequest) -> Result<AppliedTransaction, ApplyError> {
        let dealer_id = request.dealer_id();
        let variant_id = request.variant_id;

        let mut committed = self.apply_batch(vec![request], None)?;
        let transaction = committed
            .transactions
            .pop()
            .ok_or_else(|| ApplyError::InvariantViolation("commit returned no ledger entry".to_string()))?;

        let central = committed.centrals.into_iter().find(|c| c.variant_id() == variant_id);
        let dealer = committed
            .dealers
            .into_iter()
            .find(|d| Some(d.dealer_id()) == dealer_id && d.variant_id() == variant_id);

        info!(
            transaction_id = %transaction.transaction_id,
            variant_id = %variant_id,
            dealer_id = ?dealer_id,
            "stock transaction applied"
        );

        Ok(AppliedTransaction {
            transaction,
            central,
            dealer,
        })
    }

    /// Apply several requests as one unit of work, in order.
    ///
    /// Later requests see the effect of earlier ones; any failure rejects all of them.
    pub fn apply_batch(
        &self,
        requests: Vec<TransactionRequest>,
        idempotency_key: Option<String>,
    ) -> Result<Committed, ApplyError> {
        if requests.is_empty() {
            return Err(ApplyError::Validation("no transactions to apply".to_string()));
        }
        for request in &requests {
            request.validate()?;
        }

        self.with_retry(|| self.attempt(&requests, idempotency_key.as_ref()))
    }

    /// Reserve central stock for every line of an approved order in one unit of work.
    ///
    /// Redelivery of the same order is a no-op that returns the original entries.
    #[instrument(skip(self, items, staff_id), fields(order_id = %order_id, lines = items.len()), err)]
    pub fn allocate_for_order(
        &self,
        order_id: &OrderId,
        items: &[OrderLine],
        staff_id: &StaffId,
    ) -> Result<AllocationOutcome, ApplyError> {
        if items.is_empty() {
            return Err(ApplyError::Validation(format!("order {order_id} has no lines")));
        }

        let requests = items
            .iter()
            .map(|line| {
                TransactionRequest::new(
                    TransactionType::Allocate,
                    line.variant_id,
                    line.quantity,
                    staff_id.clone(),
                )
                .with_reference(order_id.as_str())
            })
            .collect();

        match self.apply_batch(requests, Some(order_idempotency_key(order_id))) {
            Ok(committed) => {
                info!(order_id = %order_id, entries = committed.transactions.len(), "order allocated");
                Ok(AllocationOutcome::Allocated(committed.transactions))
            }
            Err(ApplyError::AlreadyApplied(_)) => {
                info!(order_id = %order_id, "order already allocated; skipping");
                let entries = self.store.ledger_by_reference(order_id.as_str())?;
                Ok(AllocationOutcome::AlreadyAllocated(entries))
            }
            Err(e) => Err(e),
        }
    }

    /// Set the reorder threshold of a central or dealer row, creating it with zero stock.
    #[instrument(skip(self), err)]
    pub fn update_reorder_level(
        &self,
        scope: StockScope,
        variant_id: VariantId,
        reorder_level: i64,
    ) -> Result<(), ApplyError> {
        self.with_retry(|| {
            let mut uow = UnitOfWork::new();
            match scope {
                StockScope::Central => {
                    let mut row = self
                        .store
                        .load_central(variant_id)?
                        .unwrap_or_else(|| CentralStock::empty(variant_id));
                    row.set_reorder_level(reorder_level)?;
                    uow.centrals.push(row);
                }
                StockScope::Dealer(dealer_id) => {
                    let mut row = self.load_or_empty_dealer(dealer_id, variant_id)?;
                    row.set_reorder_level(reorder_level)?;
                    uow.dealers.push(row);
                }
            }
            self.store.commit(uow)?;
            Ok(())
        })?;

        info!(scope = %scope, variant_id = %variant_id, reorder_level, "reorder level updated");
        Ok(())
    }

    /// Set the condition tag (new/used/repaired) of an existing dealer row.
    #[instrument(skip(self), err)]
    pub fn update_dealer_status(
        &self,
        dealer_id: DealerId,
        variant_id: VariantId,
        status: &str,
    ) -> Result<DealerAllocation, ApplyError> {
        let committed = self.with_retry(|| {
            let mut row = self.store.load_dealer(dealer_id, variant_id)?.ok_or_else(|| {
                ApplyError::UnknownReference(format!(
                    "dealer {dealer_id} holds no stock for variant {variant_id}"
                ))
            })?;
            row.set_status(status)?;
            let uow = UnitOfWork {
                dealers: vec![row],
                ..UnitOfWork::new()
            };
            Ok(self.store.commit(uow)?)
        })?;

        committed
            .dealers
            .into_iter()
            .next()
            .ok_or_else(|| ApplyError::InvariantViolation("commit returned no dealer row".to_string()))
    }

    fn load_or_empty_dealer(
        &self,
        dealer_id: DealerId,
        variant_id: VariantId,
    ) -> Result<DealerAllocation, ApplyError> {
        Ok(self
            .store
            .load_dealer(dealer_id, variant_id)?
            .unwrap_or_else(|| DealerAllocation::empty(dealer_id, variant_id)))
    }

    fn attempt(
        &self,
        requests: &[TransactionRequest],
        idempotency_key: Option<&String>,
    ) -> Result<Committed, ApplyError> {
        let mut centrals: BTreeMap<VariantId, Option<CentralStock>> = BTreeMap::new();
        let mut dealers: BTreeMap<(VariantId, DealerId), Option<DealerAllocation>> = BTreeMap::new();
        let mut touched_centrals = BTreeSet::new();
        let mut touched_dealers = BTreeSet::new();

        for request in requests {
            let variant_id = request.variant_id;

            let central = if request.touches_central() {
                if !centrals.contains_key(&variant_id) {
                    centrals.insert(variant_id, self.store.load_central(variant_id)?);
                }
                centrals.get(&variant_id).cloned().flatten()
            } else {
                None
            };

            let dealer = match request.dealer_id() {
                Some(dealer_id) => {
                    let key = (variant_id, dealer_id);
                    if !dealers.contains_key(&key) {
                        dealers.insert(key, self.store.load_dealer(dealer_id, variant_id)?);
                    }
                    dealers.get(&key).cloned().flatten()
                }
                None => None,
            };

            let change = plan(request, central, dealer)?;
            if let Some(row) = change.central {
                touched_centrals.insert(variant_id);
                centrals.insert(variant_id, Some(row));
            }
            if let Some(row) = change.dealer {
                let key = (variant_id, row.dealer_id());
                touched_dealers.insert(key);
                dealers.insert(key, Some(row));
            }
        }

        let uow = UnitOfWork {
            centrals: touched_centrals
                .iter()
                .filter_map(|v| centrals.remove(v).flatten())
                .collect(),
            dealers: touched_dealers
                .iter()
                .filter_map(|k| dealers.remove(k).flatten())
                .collect(),
            entries: requests.to_vec(),
            idempotency_key: idempotency_key.cloned(),
            occurred_at: Some(Utc::now()),
        };

        Ok(self.store.commit(uow)?)
    }

    /// Run `op`, retrying version conflicts with backoff until the policy gives up.
    fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T, ApplyError>) -> Result<T, ApplyError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op() {
                Err(ApplyError::ConcurrentModification { message, .. }) => {
                    if !self.retry.should_retry(attempts) {
                        warn!(attempts, error = %message, "giving up after repeated version conflicts");
                        return Err(ApplyError::ConcurrentModification { attempts, message });
                    }
                    let delay = self.retry.delay_for_attempt(attempts);
                    warn!(attempts, delay_ms = delay.as_millis() as u64, error = %message, "version conflict; retrying");
                    thread::sleep(delay);
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::directory::StaticCatalog;
    use crate::query::StockQueryService;
    use crate::store::InMemoryStockStore;

    const V: VariantId = VariantId::new(10);
    const D1: DealerId = DealerId::new(1);

    fn staff() -> StaffId {
        StaffId::new("staff-1").unwrap()
    }

    fn req(kind: TransactionType, qty: i64) -> TransactionRequest {
        TransactionRequest::new(kind, V, qty, staff())
    }

    fn applier() -> TransactionApplier<Arc<InMemoryStockStore>> {
        TransactionApplier::new(Arc::new(InMemoryStockStore::new()))
    }

    #[test]
    fn applies_and_reports_new_rows() {
        let a = applier();
        let first = a.apply(req(TransactionType::Restock, 100)).unwrap();
        assert_eq!(first.transaction_id(), TransactionId::new(1));
        assert_eq!(first.central.unwrap().available_quantity(), 100);

        a.apply(req(TransactionType::Allocate, 30)).unwrap();
        let t = a.apply(req(TransactionType::TransferToDealer, 30).to_dealer(D1)).unwrap();
        assert_eq!(t.central.unwrap().allocated_quantity(), 0);
        assert_eq!(t.dealer.unwrap().available_quantity(), 30);
    }

    #[test]
    fn business_errors_are_not_transient() {
        let a = applier();
        a.apply(req(TransactionType::Restock, 5)).unwrap();
        let err = a.apply(req(TransactionType::Allocate, 6)).unwrap_err();
        assert!(matches!(err, ApplyError::InsufficientStock { .. }));
        assert!(!err.is_transient());

        let err = a.apply(req(TransactionType::Sale, 1).from_dealer(D1)).unwrap_err();
        assert!(matches!(err, ApplyError::UnknownReference(_)));

        let err = a.apply(req(TransactionType::Restock, 0)).unwrap_err();
        assert!(matches!(err, ApplyError::Validation(_)));
        assert_eq!(a.store().ledger(V).unwrap().len(), 1);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let a = applier();
        a.apply(req(TransactionType::Restock, 10)).unwrap();
        let err = a
            .apply_batch(
                vec![req(TransactionType::Allocate, 6), req(TransactionType::Allocate, 6)],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ApplyError::InsufficientStock { requested: 6, available: 4, .. }));
        let central = a.store().load_central(V).unwrap().unwrap();
        assert_eq!(central.available_quantity(), 10);
    }

    #[test]
    fn order_allocation_is_idempotent() {
        let a = applier();
        a.apply(req(TransactionType::Restock, 10)).unwrap();
        let order = OrderId::new("SO-1").unwrap();
        let lines = vec![OrderLine { variant_id: V, quantity: 3 }];

        let first = a.allocate_for_order(&order, &lines, &staff()).unwrap();
        assert!(matches!(first, AllocationOutcome::Allocated(_)));
        let second = a.allocate_for_order(&order, &lines, &staff()).unwrap();
        assert!(matches!(second, AllocationOutcome::AlreadyAllocated(ref t) if t.len() == 1));

        let central = a.store().load_central(V).unwrap().unwrap();
        assert_eq!((central.available_quantity(), central.allocated_quantity()), (7, 3));
    }

    #[test]
    fn reorder_level_creates_missing_rows() {
        let a = applier();
        a.update_reorder_level(StockScope::Dealer(D1), V, 4).unwrap();
        let row = a.store().load_dealer(D1, V).unwrap().unwrap();
        assert_eq!((row.reorder_level(), row.available_quantity()), (4, 0));
        assert!(a.store().ledger(V).unwrap().is_empty());

        assert!(matches!(
            a.update_reorder_level(StockScope::Central, V, -1),
            Err(ApplyError::Validation(_))
        ));
    }

    #[test]
    fn dealer_status_requires_an_existing_row() {
        let a = applier();
        assert!(matches!(
            a.update_dealer_status(D1, V, "used"),
            Err(ApplyError::UnknownReference(_))
        ));
        a.apply(req(TransactionType::AdjustmentAdd, 1).to_dealer(D1)).unwrap();
        let row = a.update_dealer_status(D1, V, "Used").unwrap();
        assert_eq!(row.status(), "used");
    }

    fn arb_request() -> impl Strategy<Value = TransactionRequest> {
        let dealer = prop_oneof![Just(None), (1i64..3).prop_map(|d| Some(DealerId::new(d)))];
        (0usize..TransactionType::ALL.len(), 1i64..15, dealer).prop_map(|(k, qty, dealer)| {
            let kind = TransactionType::ALL[k];
            let r = req(kind, qty);
            match (kind, dealer) {
                (TransactionType::TransferToDealer, d) => r.to_dealer(d.unwrap_or(D1)),
                (TransactionType::TransferToCentral | TransactionType::Sale, d) => {
                    r.from_dealer(d.unwrap_or(D1))
                }
                (TransactionType::AdjustmentAdd | TransactionType::AdjustmentSubtract, Some(d)) => {
                    r.to_dealer(d)
                }
                _ => r,
            }
        })
    }

    proptest! {
        #[test]
        fn batches_commit_whole_or_leave_the_ledger_untouched(
            batches in proptest::collection::vec(proptest::collection::vec(arb_request(), 1..5), 1..25)
        ) {
            let a = applier();
            a.apply(req(TransactionType::Restock, 20)).unwrap();
            let query = StockQueryService::new(a.store().clone(), Arc::new(StaticCatalog::new()));

            for batch in batches {
                let before = a.store().ledger(V).unwrap().len();
                let size = batch.len();
                match a.apply_batch(batch, None) {
                    Ok(committed) => {
                        prop_assert_eq!(committed.transactions.len(), size);
                        prop_assert_eq!(a.store().ledger(V).unwrap().len(), before + size);
                    }
                    Err(err) => {
                        prop_assert!(!err.is_transient());
                        prop_assert_eq!(a.store().ledger(V).unwrap().len(), before);
                    }
                }
                let report = query.reconcile(V).unwrap();
                prop_assert!(report.is_consistent(), "{:?}", report);
            }
        }
    }
}
