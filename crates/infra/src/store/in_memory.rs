use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use stockledger_core::{AggregateRoot, AlertId, DealerId, ExpectedVersion, TransactionId, VariantId};
use stockledger_inventory::{
    AlertCandidate, AlertStatus, CentralStock, DealerAllocation, InventoryTransaction,
    PhysicalVehicle, StockAlert, StockScope, TransferRequest, Vin,
};
use uuid::Uuid;

use super::r#trait::{
    outbox_envelopes, AlertStore, Committed, OutboxMessage, OutboxStore, StockStore, StoreError,
    UnitOfWork, VehicleStore,
};

/// Where an injected failure interrupts a commit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FaultPoint {
    #[default]
    None,
    /// After the central rows are written, before any dealer row.
    AfterCentralWrite,
    /// After all rows are written, before the ledger append.
    BeforeLedgerAppend,
}

#[derive(Debug, Default)]
struct State {
    centrals: BTreeMap<VariantId, CentralStock>,
    dealers: BTreeMap<(VariantId, DealerId), DealerAllocation>,
    ledger: Vec<InventoryTransaction>,
    idempotency_keys: HashSet<String>,
    outbox: BTreeMap<u64, OutboxMessage>,
    next_outbox_id: u64,
}

/// Previous row values, restored if a commit fails part-way.
#[derive(Default)]
struct Undo {
    centrals: Vec<(VariantId, Option<CentralStock>)>,
    dealers: Vec<((VariantId, DealerId), Option<DealerAllocation>)>,
}

impl Undo {
    fn rollback(self, state: &mut State) {
        for (key, previous) in self.centrals.into_iter().rev() {
            match previous {
                Some(row) => state.centrals.insert(key, row),
                None => state.centrals.remove(&key),
            };
        }
        for (key, previous) in self.dealers.into_iter().rev() {
            match previous {
                Some(row) => state.dealers.insert(key, row),
                None => state.dealers.remove(&key),
            };
        }
    }
}

/// In-memory stock store with a single lock around all state.
///
/// Intended for tests/dev. Commits write rows one by one and roll them back on
/// failure, so fault injection can exercise the atomicity guarantee.
#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    state: RwLock<State>,
    fault: Mutex<FaultPoint>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail at `point` until cleared.
    pub fn inject_fault(&self, point: FaultPoint) {
        if let Ok(mut f) = self.fault.lock() {
            *f = point;
        }
    }

    pub fn clear_fault(&self) {
        self.inject_fault(FaultPoint::None);
    }

    /// All outbox rows, published or not.
    pub fn outbox(&self) -> Vec<OutboxMessage> {
        self.state
            .read()
            .map(|s| s.outbox.values().cloned().collect())
            .unwrap_or_default()
    }

    fn fault(&self) -> FaultPoint {
        self.fault.lock().map(|f| *f).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

fn conflict(err: stockledger_core::DomainError) -> StoreError {
    StoreError::Conflict(err.to_string())
}

impl StockStore for InMemoryStockStore {
    fn load_central(&self, variant_id: VariantId) -> Result<Option<CentralStock>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.centrals.get(&variant_id).cloned())
    }

    fn load_dealer(
        &self,
        dealer_id: DealerId,
        variant_id: VariantId,
    ) -> Result<Option<DealerAllocation>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.dealers.get(&(variant_id, dealer_id)).cloned())
    }

    fn dealer_allocations(&self, variant_id: VariantId) -> Result<Vec<DealerAllocation>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .dealers
            .range((variant_id, DealerId::new(i64::MIN))..=(variant_id, DealerId::new(i64::MAX)))
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn variant_ids(&self) -> Result<Vec<VariantId>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut ids: Vec<VariantId> = state
            .centrals
            .keys()
            .copied()
            .chain(state.dealers.keys().map(|(v, _)| *v))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn commit(&self, uow: UnitOfWork) -> Result<Committed, StoreError> {
        let UnitOfWork {
            centrals,
            dealers,
            entries,
            idempotency_key,
            occurred_at,
        } = uow;
        let at = occurred_at.unwrap_or_else(Utc::now);
        let fault = self.fault();

        let mut state = self.state.write().map_err(poisoned)?;

        if let Some(key) = &idempotency_key {
            if state.idempotency_keys.contains(key) {
                return Err(StoreError::Duplicate(key.clone()));
            }
        }

        // Version checks before any write.
        let mut seen_centrals = HashSet::new();
        for row in &centrals {
            if !seen_centrals.insert(row.variant_id()) {
                return Err(StoreError::Corrupt(format!(
                    "unit of work writes central row {} twice",
                    row.variant_id()
                )));
            }
            let stored = state.centrals.get(&row.variant_id()).map(AggregateRoot::version);
            ExpectedVersion::of(row.version()).check(stored).map_err(conflict)?;
        }
        let mut seen_dealers = HashSet::new();
        for row in &dealers {
            let key = (row.variant_id(), row.dealer_id());
            if !seen_dealers.insert(key) {
                return Err(StoreError::Corrupt(format!(
                    "unit of work writes dealer row ({}, {}) twice",
                    row.dealer_id(),
                    row.variant_id()
                )));
            }
            let stored = state.dealers.get(&key).map(AggregateRoot::version);
            ExpectedVersion::of(row.version()).check(stored).map_err(conflict)?;
        }

        let mut undo = Undo::default();

        let mut written_centrals = Vec::with_capacity(centrals.len());
        for row in centrals {
            let next = row.version() + 1;
            let row = row.with_version(next);
            let previous = state.centrals.insert(row.variant_id(), row.clone());
            undo.centrals.push((row.variant_id(), previous));
            written_centrals.push(row);
        }

        if fault == FaultPoint::AfterCentralWrite && !written_centrals.is_empty() {
            undo.rollback(&mut state);
            return Err(StoreError::Backend("injected fault after central write".to_string()));
        }

        let mut written_dealers = Vec::with_capacity(dealers.len());
        for row in dealers {
            let next = row.version() + 1;
            let row = row.with_version(next);
            let key = (row.variant_id(), row.dealer_id());
            let previous = state.dealers.insert(key, row.clone());
            undo.dealers.push((key, previous));
            written_dealers.push(row);
        }

        if fault == FaultPoint::BeforeLedgerAppend {
            undo.rollback(&mut state);
            return Err(StoreError::Backend("injected fault before ledger append".to_string()));
        }

        let first = state.ledger.len() as u64 + 1;
        let records: Vec<InventoryTransaction> = entries
            .into_iter()
            .enumerate()
            .map(|(i, req)| InventoryTransaction::record(TransactionId::new(first + i as u64), req, at))
            .collect();

        let envelopes = match outbox_envelopes(&written_centrals, &written_dealers, &records, at) {
            Ok(e) => e,
            Err(err) => {
                undo.rollback(&mut state);
                return Err(err);
            }
        };

        state.ledger.extend(records.iter().cloned());
        for envelope in envelopes {
            state.next_outbox_id += 1;
            let outbox_id = state.next_outbox_id;
            state.outbox.insert(
                outbox_id,
                OutboxMessage {
                    outbox_id,
                    envelope,
                    attempts: 0,
                    last_error: None,
                    created_at: at,
                    published_at: None,
                },
            );
        }
        if let Some(key) = idempotency_key {
            state.idempotency_keys.insert(key);
        }

        Ok(Committed {
            transactions: records,
            centrals: written_centrals,
            dealers: written_dealers,
        })
    }

    fn ledger(&self, variant_id: VariantId) -> Result<Vec<InventoryTransaction>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .ledger
            .iter()
            .filter(|t| t.variant_id == variant_id)
            .cloned()
            .collect())
    }

    fn ledger_by_reference(&self, reference_id: &str) -> Result<Vec<InventoryTransaction>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .ledger
            .iter()
            .filter(|t| t.reference_id.as_deref() == Some(reference_id))
            .cloned()
            .collect())
    }
}

impl OutboxStore for InMemoryStockStore {
    fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .outbox
            .values()
            .filter(|m| m.published_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_published(&self, outbox_id: u64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let msg = state
            .outbox
            .get_mut(&outbox_id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {outbox_id}")))?;
        msg.published_at = Some(at);
        msg.attempts += 1;
        Ok(())
    }

    fn record_failure(&self, outbox_id: u64, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let msg = state
            .outbox
            .get_mut(&outbox_id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {outbox_id}")))?;
        msg.attempts += 1;
        msg.last_error = Some(error.to_string());
        Ok(())
    }

    fn history(&self, after_id: u64, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .outbox
            .range(after_id.saturating_add(1)..)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }
}

#[derive(Debug, Default)]
struct AlertState {
    alerts: BTreeMap<AlertId, StockAlert>,
    next_id: u64,
}

/// In-memory alert store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertStore {
    inner: RwLock<AlertState>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn open_for(alerts: &BTreeMap<AlertId, StockAlert>, variant_id: VariantId, scope: StockScope) -> Option<&StockAlert> {
    alerts
        .values()
        .find(|a| a.is_open() && a.variant_id == variant_id && a.scope() == scope)
}

impl AlertStore for InMemoryAlertStore {
    fn find_open(&self, variant_id: VariantId, scope: StockScope) -> Result<Option<StockAlert>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(open_for(&inner.alerts, variant_id, scope).cloned())
    }

    fn open_if_absent(
        &self,
        candidate: &AlertCandidate,
        at: DateTime<Utc>,
    ) -> Result<Option<StockAlert>, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if open_for(&inner.alerts, candidate.variant_id, candidate.scope).is_some() {
            return Ok(None);
        }
        inner.next_id += 1;
        let alert = StockAlert::open(AlertId::new(inner.next_id), candidate, at);
        inner.alerts.insert(alert.alert_id, alert.clone());
        Ok(Some(alert))
    }

    fn get(&self, alert_id: AlertId) -> Result<Option<StockAlert>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.alerts.get(&alert_id).cloned())
    }

    fn list(&self, status: Option<AlertStatus>) -> Result<Vec<StockAlert>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .alerts
            .values()
            .filter(|a| status.is_none_or(|s| a.status == s))
            .cloned()
            .collect())
    }

    fn update_status(
        &self,
        alert_id: AlertId,
        expected: AlertStatus,
        status: AlertStatus,
    ) -> Result<StockAlert, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let alert = inner
            .alerts
            .get_mut(&alert_id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {alert_id}")))?;
        if alert.status != expected {
            return Err(StoreError::Conflict(format!(
                "alert {alert_id} is {:?}, expected {expected:?}",
                alert.status
            )));
        }
        alert.status = status;
        Ok(alert.clone())
    }
}

#[derive(Debug, Default)]
struct VehicleState {
    vehicles: BTreeMap<Vin, PhysicalVehicle>,
    requests: HashMap<Uuid, TransferRequest>,
}

/// In-memory vehicle registry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryVehicleStore {
    inner: RwLock<VehicleState>,
}

impl InMemoryVehicleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VehicleStore for InMemoryVehicleStore {
    fn load_vehicle(&self, vin: &Vin) -> Result<Option<PhysicalVehicle>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.vehicles.get(vin).cloned())
    }

    fn load_request(&self, request_id: Uuid) -> Result<Option<TransferRequest>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.requests.get(&request_id).cloned())
    }

    fn is_reserved(&self, vin: &Vin) -> Result<bool, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .requests
            .values()
            .any(|r| !r.status.is_terminal() && r.vins.contains(vin)))
    }

    fn save(
        &self,
        vehicles: &[PhysicalVehicle],
        request: Option<&TransferRequest>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        for vehicle in vehicles {
            inner.vehicles.insert(vehicle.vin().clone(), vehicle.clone());
        }
        if let Some(request) = request {
            inner.requests.insert(request.request_id, request.clone());
        }
        Ok(())
    }
}
