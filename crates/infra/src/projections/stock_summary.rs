//! Dealer stock summary and regional rollup, fed by stock-level events.
//!
//! Each event carries the absolute levels of one (variant, scope) key. The per-key
//! snapshot is replaced outright; the additive regional totals move by the signed
//! difference between the new levels and the snapshot. Events at or below the
//! snapshot's sequence are skipped, which makes duplicates and stale redeliveries
//! no-ops.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockledger_core::VariantId;
use stockledger_events::{Applied, EventEnvelope, Projection};
use stockledger_inventory::directory::CENTRAL_REGION;
use stockledger_inventory::event::STOCK_LEVEL_CHANGED;
use stockledger_inventory::{DealerDirectory, StockLevelChanged, StockScope};

use crate::read_model::ReadModelStore;
use crate::store::{OutboxStore, StoreError};

/// Last applied levels of one (variant, scope) key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub variant_id: VariantId,
    pub scope: StockScope,
    pub region: String,
    pub allocated_quantity: i64,
    pub available_quantity: i64,
    pub last_sequence: u64,
}

/// Units of one variant held in one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionTotal {
    pub region: String,
    pub variant_id: VariantId,
    pub available_quantity: i64,
    pub allocated_quantity: i64,
}

pub type SnapshotKey = (VariantId, StockScope);
pub type RegionKey = (String, VariantId);

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize stock event: {0}")]
    Deserialize(String),

    #[error("event for variant {found} arrived on partition '{partition}'")]
    PartitionMismatch { partition: String, found: VariantId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub struct StockSummaryProjection<S, R, D> {
    snapshots: S,
    regions: R,
    directory: D,
    apply_lock: Mutex<()>,
}

impl<S, R, D> StockSummaryProjection<S, R, D>
where
    S: ReadModelStore<SnapshotKey, StockSnapshot>,
    R: ReadModelStore<RegionKey, RegionTotal>,
    D: DealerDirectory,
{
    pub fn new(snapshots: S, regions: R, directory: D) -> Self {
        Self {
            snapshots,
            regions,
            directory,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self, variant_id: VariantId, scope: StockScope) -> Option<StockSnapshot> {
        self.snapshots.get(&(variant_id, scope))
    }

    /// Dealer snapshots of one variant, by dealer id.
    pub fn dealer_summary(&self, variant_id: VariantId) -> Vec<StockSnapshot> {
        let mut rows: Vec<_> = self
            .snapshots
            .list()
            .into_iter()
            .filter(|s| s.variant_id == variant_id && s.scope != StockScope::Central)
            .collect();
        rows.sort_by_key(|s| s.scope.dealer_id());
        rows
    }

    pub fn region_total(&self, region: &str, variant_id: VariantId) -> Option<RegionTotal> {
        self.regions.get(&(region.to_string(), variant_id))
    }

    /// All regional totals, ordered by region then variant.
    pub fn region_totals(&self) -> Vec<RegionTotal> {
        let mut totals = self.regions.list();
        totals.sort_by(|a, b| (&a.region, a.variant_id).cmp(&(&b.region, b.variant_id)));
        totals
    }

    /// Apply one published envelope.
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<Applied, ProjectionError> {
        if envelope.event_type() != STOCK_LEVEL_CHANGED {
            return Ok(Applied::Skipped);
        }
        let event: StockLevelChanged = envelope
            .decode()
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;
        if envelope.partition_key() != event.variant_id.to_string() {
            return Err(ProjectionError::PartitionMismatch {
                partition: envelope.partition_key().to_string(),
                found: event.variant_id,
            });
        }

        let seq = envelope.sequence_number();
        let key = (event.variant_id, event.scope);

        // Snapshot read and region delta must not interleave with another apply.
        let _guard = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());

        let previous = self.snapshots.get(&key);
        if previous.as_ref().is_some_and(|p| seq <= p.last_sequence) {
            return Ok(Applied::Skipped);
        }

        let region = match &previous {
            Some(p) => p.region.clone(),
            None => self.region_for(event.scope),
        };
        let (last_available, last_allocated) = previous
            .as_ref()
            .map(|p| (p.available_quantity, p.allocated_quantity))
            .unwrap_or_default();

        let region_key = (region.clone(), event.variant_id);
        let mut total = self.regions.get(&region_key).unwrap_or(RegionTotal {
            region: region.clone(),
            variant_id: event.variant_id,
            available_quantity: 0,
            allocated_quantity: 0,
        });
        total.available_quantity += event.available_quantity - last_available;
        total.allocated_quantity += event.allocated_quantity - last_allocated;
        self.regions.upsert(region_key, total);

        self.snapshots.upsert(
            key,
            StockSnapshot {
                variant_id: event.variant_id,
                scope: event.scope,
                region,
                allocated_quantity: event.allocated_quantity,
                available_quantity: event.available_quantity,
                last_sequence: seq,
            },
        );

        Ok(Applied::Updated)
    }

    /// Rebuild both read models from scratch by replaying envelopes in sequence order.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        self.snapshots.clear();
        self.regions.clear();

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| e.sequence_number());
        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }

    /// Rebuild from every event the outbox has recorded, published or not.
    ///
    /// Returns the number of envelopes replayed.
    pub fn rebuild_from_outbox<O: OutboxStore>(&self, outbox: &O, page_size: usize) -> Result<usize, ProjectionError> {
        let page_size = page_size.max(1);
        let mut envelopes = Vec::new();
        let mut after = 0;
        loop {
            let page = outbox.history(after, page_size)?;
            let Some(last) = page.last() else { break };
            after = last.outbox_id;
            let full = page.len() == page_size;
            envelopes.extend(page.into_iter().map(|m| m.envelope));
            if !full {
                break;
            }
        }

        let replayed = envelopes.len();
        self.rebuild_from_scratch(envelopes)?;
        Ok(replayed)
    }

    fn region_for(&self, scope: StockScope) -> String {
        match scope {
            StockScope::Central => CENTRAL_REGION.to_string(),
            StockScope::Dealer(dealer_id) => self.directory.region_of(dealer_id),
        }
    }
}

impl<S, R, D> Projection for StockSummaryProjection<S, R, D>
where
    S: ReadModelStore<SnapshotKey, StockSnapshot>,
    R: ReadModelStore<RegionKey, RegionTotal>,
    D: DealerDirectory,
{
    type Payload = JsonValue;
    type Error = ProjectionError;

    fn name(&self) -> &'static str {
        "stock_summary"
    }

    fn apply(&self, envelope: &EventEnvelope<JsonValue>) -> Result<Applied, ProjectionError> {
        self.apply_envelope(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use stockledger_core::{DealerId, TransactionId};
    use stockledger_inventory::{DealerInfo, TransactionType};

    use crate::directory::StaticDealerDirectory;
    use crate::read_model::InMemoryReadModelStore;

    type Summary = StockSummaryProjection<
        InMemoryReadModelStore<SnapshotKey, StockSnapshot>,
        InMemoryReadModelStore<RegionKey, RegionTotal>,
        Arc<StaticDealerDirectory>,
    >;

    const V: VariantId = VariantId::new(5);

    fn projection() -> Summary {
        let directory = Arc::new(StaticDealerDirectory::new());
        for (id, region) in [(1, "NORTH"), (2, "NORTH")] {
            directory.insert(DealerInfo {
                dealer_id: DealerId::new(id),
                name: format!("Dealer {id}"),
                region: region.to_string(),
            });
        }
        StockSummaryProjection::new(
            InMemoryReadModelStore::new(),
            InMemoryReadModelStore::new(),
            directory,
        )
    }

    fn dealer_event(dealer: i64, seq: u64, allocated: i64, available: i64) -> EventEnvelope<JsonValue> {
        let event = StockLevelChanged {
            variant_id: V,
            scope: StockScope::Dealer(DealerId::new(dealer)),
            allocated_quantity: allocated,
            available_quantity: available,
            total_imported: None,
            transaction_id: TransactionId::new(seq),
            transaction_type: TransactionType::Sale,
            occurred_at: Utc::now(),
        };
        EventEnvelope::from_typed(Uuid::now_v7(), seq, &event).unwrap()
    }

    #[test]
    fn region_totals_follow_signed_deltas() {
        let p = projection();
        p.apply_envelope(&dealer_event(1, 3, 30, 30)).unwrap();
        p.apply_envelope(&dealer_event(2, 4, 10, 10)).unwrap();
        p.apply_envelope(&dealer_event(1, 5, 30, 25)).unwrap();

        let north = p.region_total("NORTH", V).unwrap();
        assert_eq!(north.available_quantity, 35);
        assert_eq!(north.allocated_quantity, 40);
        assert_eq!(p.dealer_summary(V).len(), 2);
    }

    #[test]
    fn duplicates_and_stale_events_are_skipped() {
        let p = projection();
        let newer = dealer_event(1, 7, 30, 20);
        assert_eq!(p.apply_envelope(&newer).unwrap(), Applied::Updated);
        assert_eq!(p.apply_envelope(&newer).unwrap(), Applied::Skipped);
        assert_eq!(p.apply_envelope(&dealer_event(1, 6, 30, 28)).unwrap(), Applied::Skipped);

        assert_eq!(p.region_total("NORTH", V).unwrap().available_quantity, 20);
        assert_eq!(p.snapshot(V, StockScope::Dealer(DealerId::new(1))).unwrap().last_sequence, 7);
    }

    #[test]
    fn unknown_dealers_roll_up_as_unassigned() {
        let p = projection();
        p.apply_envelope(&dealer_event(9, 1, 4, 4)).unwrap();
        assert_eq!(p.region_totals()[0].region, "UNASSIGNED");
    }

    #[test]
    fn rebuild_matches_in_order_delivery() {
        let p = projection();
        let events = vec![dealer_event(1, 5, 30, 25), dealer_event(1, 3, 30, 30), dealer_event(2, 4, 10, 10)];
        for e in &events {
            p.apply_envelope(e).unwrap();
        }
        let live = p.region_totals();

        p.rebuild_from_scratch(events).unwrap();
        assert_eq!(p.region_totals(), live);
    }

    #[test]
    fn rebuild_from_outbox_replays_recorded_stock_events() {
        use stockledger_core::StaffId;
        use stockledger_inventory::TransactionRequest;

        use crate::applier::TransactionApplier;
        use crate::store::InMemoryStockStore;

        let store = Arc::new(InMemoryStockStore::new());
        let applier = TransactionApplier::new(store.clone());
        let staff = StaffId::new("s").unwrap();
        applier
            .apply(TransactionRequest::new(TransactionType::Restock, V, 10, staff.clone()))
            .unwrap();
        applier
            .apply(TransactionRequest::new(TransactionType::Allocate, V, 4, staff.clone()))
            .unwrap();
        applier
            .apply(
                TransactionRequest::new(TransactionType::TransferToDealer, V, 4, staff)
                    .to_dealer(DealerId::new(1)),
            )
            .unwrap();
        let published = store.pending(1).unwrap()[0].outbox_id;
        store.mark_published(published, Utc::now()).unwrap();

        let p = projection();
        p.apply_envelope(&dealer_event(2, 1, 99, 99)).unwrap();
        let replayed = p.rebuild_from_outbox(&store, 2).unwrap();

        assert_eq!(replayed, store.outbox().len());
        assert!(p.snapshot(V, StockScope::Dealer(DealerId::new(2))).is_none());
        let north = p.region_total("NORTH", V).unwrap();
        assert_eq!((north.allocated_quantity, north.available_quantity), (4, 4));
        let central = p.snapshot(V, StockScope::Central).unwrap();
        assert_eq!(central.available_quantity, 6);
    }
}
