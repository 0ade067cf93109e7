//! Read side over the stock rows and the ledger.
//!
//! Reads go straight to the store and never take write-path locks; a view may be a
//! commit behind a concurrent writer.

use thiserror::Error;
use tracing::{instrument, warn};

use stockledger_core::VariantId;
use stockledger_inventory::{
    ledger_net_total, replay, Catalog, InventoryFilter, InventoryStatusView, InventoryTransaction,
    Page, Paged, ReconciliationReport,
};

use crate::store::{StockStore, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("variant {0} has no stock records")]
    UnknownVariant(VariantId),

    /// The ledger could not be replayed (an entry breaks the movement rules).
    #[error("ledger for variant {variant_id} is inconsistent: {message}")]
    Ledger { variant_id: VariantId, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub struct StockQueryService<S, C> {
    store: S,
    catalog: C,
}

impl<S: StockStore, C: Catalog> StockQueryService<S, C> {
    pub fn new(store: S, catalog: C) -> Self {
        Self { store, catalog }
    }

    /// Current status of one variant across central and every dealer.
    #[instrument(skip(self), err)]
    pub fn get_inventory_status(&self, variant_id: VariantId) -> Result<InventoryStatusView, QueryError> {
        self.status_of(variant_id)?
            .ok_or(QueryError::UnknownVariant(variant_id))
    }

    /// Status views for every stocked variant matching the filter, in variant order.
    #[instrument(skip(self, filter), fields(dealer_id = ?filter.dealer_id, search = ?filter.search), err)]
    pub fn list_inventory(
        &self,
        filter: &InventoryFilter,
        page: Page,
    ) -> Result<Paged<InventoryStatusView>, QueryError> {
        let needle = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty());

        let mut views = Vec::new();
        for variant_id in self.store.variant_ids()? {
            if let Some(needle) = needle {
                let matched = self
                    .catalog
                    .variant(variant_id)
                    .is_some_and(|info| info.matches(needle));
                if !matched {
                    continue;
                }
            }
            let Some(view) = self.status_of(variant_id)? else {
                continue;
            };
            if let Some(view) = filter.narrow(view) {
                views.push(view);
            }
        }

        Ok(page.slice(views))
    }

    /// Ledger entries of a variant, oldest first.
    pub fn ledger(&self, variant_id: VariantId, page: Page) -> Result<Paged<InventoryTransaction>, QueryError> {
        Ok(page.slice(self.store.ledger(variant_id)?))
    }

    /// Compare stored rows against a replay of the ledger.
    #[instrument(skip(self), err)]
    pub fn reconcile(&self, variant_id: VariantId) -> Result<ReconciliationReport, QueryError> {
        let central = self.store.load_central(variant_id)?;
        let dealers = self.store.dealer_allocations(variant_id)?;
        let entries = self.store.ledger(variant_id)?;

        let replayed = replay(variant_id, &entries).map_err(|e| QueryError::Ledger {
            variant_id,
            message: e.to_string(),
        })?;

        let status = InventoryStatusView::build(variant_id, central.as_ref(), &dealers);
        let report = ReconciliationReport::build(
            &status,
            entries.len(),
            ledger_net_total(&entries),
            &replayed,
            central.as_ref(),
            &dealers,
        );

        if !report.is_consistent() {
            warn!(
                variant_id = %variant_id,
                ledger_net = report.ledger_net,
                total_in_system = report.total_in_system,
                mismatched = ?report.mismatched_rows,
                "stock rows disagree with the ledger"
            );
        }
        Ok(report)
    }

    fn status_of(&self, variant_id: VariantId) -> Result<Option<InventoryStatusView>, QueryError> {
        let central = self.store.load_central(variant_id)?;
        let dealers = self.store.dealer_allocations(variant_id)?;
        if central.is_none() && dealers.is_empty() {
            return Ok(None);
        }

        let name = self.catalog.variant(variant_id).map(|v| v.display_name());
        Ok(Some(
            InventoryStatusView::build(variant_id, central.as_ref(), &dealers).with_name(name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use stockledger_core::{DealerId, StaffId};
    use stockledger_inventory::{TransactionRequest, TransactionType, VariantInfo};

    use crate::applier::TransactionApplier;
    use crate::directory::StaticCatalog;
    use crate::store::InMemoryStockStore;

    const V1: VariantId = VariantId::new(1);
    const V2: VariantId = VariantId::new(2);
    const D1: DealerId = DealerId::new(7);

    fn seeded() -> StockQueryService<Arc<InMemoryStockStore>, Arc<StaticCatalog>> {
        let store = Arc::new(InMemoryStockStore::new());
        let catalog = Arc::new(StaticCatalog::new());
        catalog.insert(VariantInfo {
            variant_id: V1,
            model_name: "Aurora".to_string(),
            variant_name: "GT".to_string(),
        });
        catalog.insert(VariantInfo {
            variant_id: V2,
            model_name: "Breeze".to_string(),
            variant_name: "Base".to_string(),
        });

        let applier = TransactionApplier::new(store.clone());
        let staff = StaffId::new("s-1").unwrap();
        let r = |t, v, q| TransactionRequest::new(t, v, q, staff.clone());
        applier.apply(r(TransactionType::Restock, V1, 100)).unwrap();
        applier.apply(r(TransactionType::Allocate, V1, 30)).unwrap();
        applier
            .apply(r(TransactionType::TransferToDealer, V1, 30).to_dealer(D1))
            .unwrap();
        applier.apply(r(TransactionType::Sale, V1, 5).from_dealer(D1)).unwrap();
        applier.apply(r(TransactionType::InitialStock, V2, 4)).unwrap();

        StockQueryService::new(store, catalog)
    }

    #[test]
    fn status_reports_system_total_and_name() {
        let q = seeded();
        let view = q.get_inventory_status(V1).unwrap();
        assert_eq!(view.total_in_system, 95);
        assert_eq!(view.central_available, 70);
        assert_eq!(view.per_dealer[0].available, 25);
        assert_eq!(view.variant_name.as_deref(), Some("Aurora GT"));

        assert_eq!(
            q.get_inventory_status(VariantId::new(99)),
            Err(QueryError::UnknownVariant(VariantId::new(99)))
        );
    }

    #[test]
    fn list_filters_by_search_and_dealer() {
        let q = seeded();
        let all = q.list_inventory(&InventoryFilter::default(), Page::default()).unwrap();
        assert_eq!(all.total, 2);

        let search = InventoryFilter {
            search: Some("breeze".to_string()),
            ..InventoryFilter::default()
        };
        let found = q.list_inventory(&search, Page::default()).unwrap();
        assert_eq!(found.items.iter().map(|v| v.variant_id).collect::<Vec<_>>(), vec![V2]);

        let dealer = InventoryFilter {
            dealer_id: Some(D1),
            ..InventoryFilter::default()
        };
        let scoped = q.list_inventory(&dealer, Page::new(0, 10)).unwrap();
        assert_eq!(scoped.total, 1);
        assert_eq!(scoped.items[0].variant_id, V1);
    }

    #[test]
    fn reconciliation_agrees_with_ledger() {
        let q = seeded();
        let report = q.reconcile(V1).unwrap();
        assert!(report.is_consistent(), "{report:?}");
        assert_eq!(report.ledger_entries, 4);
        assert_eq!(report.ledger_net, 95);

        let ledger = q.ledger(V1, Page::new(1, 2)).unwrap();
        assert_eq!(ledger.total, 4);
        assert_eq!(ledger.items.len(), 2);
    }
}
