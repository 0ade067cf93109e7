//! Reorder alerts: periodic scan over stock rows plus the acknowledge/resolve lifecycle.
//!
//! The scan reads rows without holding anything on the write path; a row that moves
//! mid-scan is picked up on the next run. At most one NEW alert exists per key, which
//! the alert store enforces atomically so overlapping scans cannot double-open.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use stockledger_core::{AlertId, DomainError, VariantId};
use stockledger_inventory::{AlertCandidate, AlertStatus, StockAlert};

use crate::store::{AlertStore, StockStore, StoreError};
use crate::workers::periodic::{PeriodicHandle, PeriodicRunner};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("alert {0} not found")]
    NotFound(AlertId),

    #[error("invalid alert transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub variants_scanned: usize,
    /// Keys at or below their reorder level.
    pub candidates: usize,
    pub opened: Vec<StockAlert>,
    /// Candidates that already had a NEW alert.
    pub already_open: usize,
    /// Variants skipped because reading or writing them failed.
    pub failed: Vec<VariantId>,
}

#[derive(Debug)]
pub struct StockAlertEngine<S, A> {
    stock: S,
    alerts: A,
}

impl<S: StockStore, A: AlertStore> StockAlertEngine<S, A> {
    pub fn new(stock: S, alerts: A) -> Self {
        Self { stock, alerts }
    }

    /// Open a NEW alert for every key at or below its threshold that has none.
    ///
    /// Failures are isolated per variant: they are logged, reported and skipped.
    pub fn scan(&self, now: DateTime<Utc>) -> Result<ScanReport, AlertError> {
        let mut report = ScanReport::default();

        for variant_id in self.stock.variant_ids()? {
            report.variants_scanned += 1;
            if let Err(e) = self.scan_variant(variant_id, now, &mut report) {
                warn!(variant_id = %variant_id, error = %e, "alert scan failed for variant; skipping");
                report.failed.push(variant_id);
            }
        }

        if !report.opened.is_empty() || !report.failed.is_empty() {
            info!(
                scanned = report.variants_scanned,
                opened = report.opened.len(),
                already_open = report.already_open,
                failed = report.failed.len(),
                "stock alert scan finished"
            );
        }
        Ok(report)
    }

    fn scan_variant(
        &self,
        variant_id: VariantId,
        now: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Result<(), StoreError> {
        let central = self.stock.load_central(variant_id)?;
        let dealers = self.stock.dealer_allocations(variant_id)?;

        let candidates = central
            .iter()
            .filter_map(AlertCandidate::from_central)
            .chain(dealers.iter().filter_map(AlertCandidate::from_dealer));

        for candidate in candidates {
            report.candidates += 1;
            match self.alerts.open_if_absent(&candidate, now)? {
                Some(alert) => {
                    info!(
                        alert_id = %alert.alert_id,
                        variant_id = %alert.variant_id,
                        scope = %candidate.scope,
                        alert_type = alert.alert_type.as_str(),
                        current_stock = alert.current_stock,
                        threshold = alert.threshold,
                        "stock alert opened"
                    );
                    report.opened.push(alert);
                }
                None => report.already_open += 1,
            }
        }
        Ok(())
    }

    /// Alerts that are not yet resolved, oldest first.
    pub fn list_active(&self) -> Result<Vec<StockAlert>, AlertError> {
        let mut active = self.alerts.list(None)?;
        active.retain(|a| a.status != AlertStatus::Resolved);
        Ok(active)
    }

    pub fn list(&self, status: Option<AlertStatus>) -> Result<Vec<StockAlert>, AlertError> {
        Ok(self.alerts.list(status)?)
    }

    pub fn acknowledge(&self, alert_id: AlertId) -> Result<StockAlert, AlertError> {
        self.transition(alert_id, AlertStatus::Acknowledged)
    }

    pub fn resolve(&self, alert_id: AlertId) -> Result<StockAlert, AlertError> {
        self.transition(alert_id, AlertStatus::Resolved)
    }

    fn transition(&self, alert_id: AlertId, next: AlertStatus) -> Result<StockAlert, AlertError> {
        let mut alert = self.alerts.get(alert_id)?.ok_or(AlertError::NotFound(alert_id))?;
        let previous = alert.status;
        alert.transition(next).map_err(|e| match e {
            DomainError::Validation(msg) => AlertError::InvalidTransition(msg),
            other => AlertError::InvalidTransition(other.to_string()),
        })?;
        // Conditional on the status the transition was checked against.
        let stored = self.alerts.update_status(alert_id, previous, alert.status)?;
        info!(alert_id = %alert_id, status = stored.status.as_str(), "stock alert updated");
        Ok(stored)
    }
}

impl<S, A> StockAlertEngine<S, A>
where
    S: StockStore + 'static,
    A: AlertStore + 'static,
{
    /// Run `scan` on a background thread with the given schedule.
    pub fn spawn_scheduler(self, schedule: &PeriodicRunner) -> std::io::Result<PeriodicHandle> {
        schedule.spawn("stock-alert-scan", move || self.scan(Utc::now()).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use stockledger_core::{DealerId, StaffId};
    use stockledger_inventory::{AlertType, StockScope, TransactionRequest, TransactionType};

    use crate::applier::TransactionApplier;
    use crate::store::{InMemoryAlertStore, InMemoryStockStore};

    const V: VariantId = VariantId::new(3);
    const D1: DealerId = DealerId::new(1);

    type Engine = StockAlertEngine<Arc<InMemoryStockStore>, Arc<InMemoryAlertStore>>;

    fn setup() -> (TransactionApplier<Arc<InMemoryStockStore>>, Engine) {
        let store = Arc::new(InMemoryStockStore::new());
        let engine = StockAlertEngine::new(store.clone(), Arc::new(InMemoryAlertStore::new()));
        (TransactionApplier::new(store), engine)
    }

    fn req(kind: TransactionType, qty: i64) -> TransactionRequest {
        TransactionRequest::new(kind, V, qty, StaffId::new("s").unwrap())
    }

    #[test]
    fn repeated_scans_keep_one_new_alert_per_key() {
        let (applier, engine) = setup();
        applier.apply(req(TransactionType::Restock, 10)).unwrap();
        applier.update_reorder_level(StockScope::Central, V, 10).unwrap();

        let first = engine.scan(Utc::now()).unwrap();
        assert_eq!(first.opened.len(), 1);
        assert_eq!(first.opened[0].alert_type, AlertType::LowStock);

        let second = engine.scan(Utc::now()).unwrap();
        assert!(second.opened.is_empty());
        assert_eq!(second.already_open, 1);
        assert_eq!(engine.list_active().unwrap().len(), 1);
    }

    #[test]
    fn zero_threshold_never_alerts_and_recovery_keeps_alert() {
        let (applier, engine) = setup();
        applier.apply(req(TransactionType::AdjustmentAdd, 1).to_dealer(D1)).unwrap();
        assert_eq!(engine.scan(Utc::now()).unwrap().candidates, 0);

        applier.apply(req(TransactionType::AdjustmentSubtract, 1).from_dealer(D1)).unwrap();
        applier.update_reorder_level(StockScope::Dealer(D1), V, 2).unwrap();
        let report = engine.scan(Utc::now()).unwrap();
        assert_eq!(report.opened[0].alert_type, AlertType::OutOfStock);
        assert_eq!(report.opened[0].dealer_id, Some(D1));

        applier.apply(req(TransactionType::AdjustmentAdd, 10).to_dealer(D1)).unwrap();
        engine.scan(Utc::now()).unwrap();
        assert_eq!(engine.list_active().unwrap().len(), 1);
    }

    #[test]
    fn lifecycle_transitions_are_checked() {
        let (applier, engine) = setup();
        applier.update_reorder_level(StockScope::Central, V, 1).unwrap();
        let alert = engine.scan(Utc::now()).unwrap().opened.remove(0);

        let acked = engine.acknowledge(alert.alert_id).unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert!(matches!(
            engine.acknowledge(alert.alert_id),
            Err(AlertError::InvalidTransition(_))
        ));
        engine.resolve(alert.alert_id).unwrap();
        assert!(engine.list_active().unwrap().is_empty());

        assert_eq!(
            engine.resolve(AlertId::new(999)),
            Err(AlertError::NotFound(AlertId::new(999)))
        );
    }

    #[test]
    fn concurrent_acknowledgements_apply_once() {
        let (applier, engine) = setup();
        applier.update_reorder_level(StockScope::Central, V, 1).unwrap();
        let alert = engine.scan(Utc::now()).unwrap().opened.remove(0);

        let engine = Arc::new(engine);
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.acknowledge(alert.alert_id)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().all(|r| matches!(
            r,
            Ok(_) | Err(AlertError::InvalidTransition(_)) | Err(AlertError::Store(StoreError::Conflict(_)))
        )));
        assert_eq!(engine.alerts.get(alert.alert_id).unwrap().unwrap().status, AlertStatus::Acknowledged);
    }

    #[test]
    fn resolve_racing_acknowledge_cannot_be_overwritten() {
        let (applier, engine) = setup();
        applier.update_reorder_level(StockScope::Central, V, 1).unwrap();
        let alert = engine.scan(Utc::now()).unwrap().opened.remove(0);

        // An acknowledge that read NEW before this resolve landed.
        engine.resolve(alert.alert_id).unwrap();
        assert!(matches!(
            engine.alerts.update_status(alert.alert_id, AlertStatus::New, AlertStatus::Acknowledged),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(engine.alerts.get(alert.alert_id).unwrap().unwrap().status, AlertStatus::Resolved);
    }
}
