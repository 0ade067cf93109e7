//! Read-side views over the stock rows of a variant.

use serde::{Deserialize, Serialize};

use stockledger_core::{DealerId, VariantId};

use crate::movement::Replayed;
use crate::stock::{CentralStock, DealerAllocation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealerStockView {
    pub dealer_id: DealerId,
    pub allocated: i64,
    pub available: i64,
    pub reorder_level: i64,
    pub status: String,
}

impl From<&DealerAllocation> for DealerStockView {
    fn from(row: &DealerAllocation) -> Self {
        Self {
            dealer_id: row.dealer_id(),
            allocated: row.allocated_quantity(),
            available: row.available_quantity(),
            reorder_level: row.reorder_level(),
            status: row.status().to_string(),
        }
    }
}

/// Point-in-time stock of one variant across the warehouse and all dealers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryStatusView {
    pub variant_id: VariantId,
    /// Display name from the catalog, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_name: Option<String>,
    pub total_in_system: i64,
    pub total_imported: i64,
    pub central_available: i64,
    pub central_allocated: i64,
    pub central_reorder_level: i64,
    pub per_dealer: Vec<DealerStockView>,
}

impl InventoryStatusView {
    /// Dealer `allocated` is the cumulative assignment and already includes sold units,
    /// so only dealer `available` counts toward the system total.
    pub fn build(
        variant_id: VariantId,
        central: Option<&CentralStock>,
        dealers: &[DealerAllocation],
    ) -> Self {
        let mut per_dealer: Vec<DealerStockView> = dealers
            .iter()
            .filter(|d| d.variant_id() == variant_id)
            .map(DealerStockView::from)
            .collect();
        per_dealer.sort_by_key(|d| d.dealer_id);

        let (total_imported, central_available, central_allocated, central_reorder_level) = central
            .map(|c| {
                (
                    c.total_imported(),
                    c.available_quantity(),
                    c.allocated_quantity(),
                    c.reorder_level(),
                )
            })
            .unwrap_or_default();

        let dealer_available: i64 = per_dealer.iter().map(|d| d.available).sum();

        Self {
            variant_id,
            variant_name: None,
            total_in_system: central_available + central_allocated + dealer_available,
            total_imported,
            central_available,
            central_allocated,
            central_reorder_level,
            per_dealer,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.variant_name = name;
        self
    }
}

/// Filters for listing stock status across variants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFilter {
    #[serde(default)]
    pub dealer_id: Option<DealerId>,
    /// Dealer condition tag (new/used/repaired).
    #[serde(default)]
    pub status: Option<String>,
    /// Free-text match on the catalog name.
    #[serde(default)]
    pub search: Option<String>,
}

impl InventoryFilter {
    pub fn is_dealer_scoped(&self) -> bool {
        self.dealer_id.is_some() || self.status.is_some()
    }

    /// Narrow the dealer rows of a view; `None` when a dealer-scoped filter leaves nothing.
    pub fn narrow(&self, mut view: InventoryStatusView) -> Option<InventoryStatusView> {
        if !self.is_dealer_scoped() {
            return Some(view);
        }
        let status = self.status.as_deref().map(str::to_ascii_lowercase);
        view.per_dealer.retain(|d| {
            self.dealer_id.is_none_or(|id| d.dealer_id == id)
                && status.as_deref().is_none_or(|s| d.status == s)
        });
        (!view.per_dealer.is_empty()).then_some(view)
    }
}

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }.clamped()
    }

    pub fn clamped(self) -> Self {
        Self {
            offset: self.offset,
            limit: self.limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn slice<T>(self, items: Vec<T>) -> Paged<T> {
        let page = self.clamped();
        let total = items.len();
        let items = items.into_iter().skip(page.offset).take(page.limit).collect();
        Paged {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Ledger vs. stored rows for one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub variant_id: VariantId,
    pub ledger_entries: usize,
    /// Σ receipts and positive adjustments − Σ sales and negative adjustments.
    pub ledger_net: i64,
    /// Total computed by replaying the ledger from zero.
    pub replayed_total: i64,
    /// Total computed from the stored rows.
    pub total_in_system: i64,
    /// Rows whose stored quantities differ from the replayed ones.
    pub mismatched_rows: Vec<String>,
}

impl ReconciliationReport {
    pub fn build(
        status: &InventoryStatusView,
        ledger_entries: usize,
        ledger_net: i64,
        replayed: &Replayed,
        central: Option<&CentralStock>,
        dealers: &[DealerAllocation],
    ) -> Self {
        let mut mismatched_rows = Vec::new();

        let quantities = |c: &CentralStock| {
            (c.total_imported(), c.allocated_quantity(), c.available_quantity())
        };
        // Rows created only to hold a threshold have no ledger entries.
        let stored = central.map(quantities).unwrap_or_default();
        if stored != replayed.central.as_ref().map(quantities).unwrap_or_default() {
            mismatched_rows.push("central".to_string());
        }
        for d in dealers.iter().filter(|d| d.variant_id() == status.variant_id) {
            let expected = replayed
                .dealers
                .get(&d.dealer_id())
                .map(|r| (r.allocated_quantity(), r.available_quantity()))
                .unwrap_or_default();
            if expected != (d.allocated_quantity(), d.available_quantity()) {
                mismatched_rows.push(format!("dealer {}", d.dealer_id()));
            }
        }
        for id in replayed.dealers.keys() {
            let stored = dealers
                .iter()
                .any(|d| d.variant_id() == status.variant_id && d.dealer_id() == *id);
            if !stored {
                mismatched_rows.push(format!("dealer {id} (missing)"));
            }
        }

        Self {
            variant_id: status.variant_id,
            ledger_entries,
            ledger_net,
            replayed_total: replayed.total_in_system(),
            total_in_system: status.total_in_system,
            mismatched_rows,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.ledger_net == self.total_in_system
            && self.replayed_total == self.total_in_system
            && self.mismatched_rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dealer(id: i64, allocated: i64, available: i64, status: &str) -> DealerAllocation {
        DealerAllocation::restore(DealerId::new(id), VariantId::new(10), allocated, available, 0, status, 1)
            .unwrap()
    }

    #[test]
    fn status_counts_dealer_available_only() {
        let central = CentralStock::restore(VariantId::new(10), 100, 0, 70, 5, 4).unwrap();
        let view = InventoryStatusView::build(
            VariantId::new(10),
            Some(&central),
            &[dealer(1, 30, 25, "new")],
        );
        assert_eq!(view.total_in_system, 95);
        assert_eq!(view.central_available, 70);
        assert_eq!(view.per_dealer[0].allocated, 30);
    }

    #[test]
    fn missing_rows_produce_a_zero_view() {
        let view = InventoryStatusView::build(VariantId::new(4), None, &[]);
        assert_eq!(view.total_in_system, 0);
        assert!(view.per_dealer.is_empty());
    }

    #[test]
    fn filter_narrows_dealer_rows() {
        let view = InventoryStatusView::build(
            VariantId::new(10),
            None,
            &[dealer(1, 5, 5, "new"), dealer(2, 3, 1, "used")],
        );
        let by_status = InventoryFilter {
            status: Some("USED".into()),
            ..Default::default()
        };
        let narrowed = by_status.narrow(view.clone()).unwrap();
        assert_eq!(narrowed.per_dealer.len(), 1);
        assert_eq!(narrowed.per_dealer[0].dealer_id, DealerId::new(2));

        let none = InventoryFilter {
            dealer_id: Some(DealerId::new(9)),
            ..Default::default()
        };
        assert!(none.narrow(view.clone()).is_none());
        assert!(InventoryFilter::default().narrow(view).is_some());
    }

    #[test]
    fn threshold_only_rows_reconcile() {
        let central = CentralStock::restore(VariantId::new(10), 0, 0, 0, 5, 1).unwrap();
        let status = InventoryStatusView::build(VariantId::new(10), Some(&central), &[]);
        let report =
            ReconciliationReport::build(&status, 0, 0, &Replayed::default(), Some(&central), &[]);
        assert!(report.is_consistent());
    }

    #[test]
    fn paging_clamps_limit() {
        let paged = Page::new(2, 0).slice((0..5).collect::<Vec<_>>());
        assert_eq!(paged.items, vec![2]);
        assert_eq!(paged.total, 5);
        assert_eq!(Page::new(0, 1_000).limit, MAX_PAGE_SIZE);
    }
}
