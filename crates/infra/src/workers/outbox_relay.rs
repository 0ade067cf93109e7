//! Outbox relay: drains committed stock events to the bus.
//!
//! ```text
//! stock_outbox (written with the ledger)
//!   ↓ pending(batch_size), oldest first
//! EventBus::publish
//!   ├─ ok  → mark_published
//!   └─ err → record_failure, stop the batch, retry on backoff
//! ```
//!
//! Publishing never touches stock rows, so a bus outage delays events without
//! blocking or undoing any write.

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use stockledger_events::{EventBus, EventEnvelope};

use crate::store::{OutboxStore, StoreError};
use crate::workers::periodic::{PeriodicHandle, PeriodicRunner};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("publish of outbox message {outbox_id} failed: {message}")]
    Publish { outbox_id: u64, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub published: usize,
}

#[derive(Debug)]
pub struct OutboxRelay<O, B> {
    outbox: O,
    bus: B,
    batch_size: usize,
}

impl<O, B> OutboxRelay<O, B>
where
    O: OutboxStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
{
    pub fn new(outbox: O, bus: B, batch_size: usize) -> Self {
        Self {
            outbox,
            bus,
            batch_size: batch_size.max(1),
        }
    }

    /// Publish pending messages in order until the outbox is empty or a publish fails.
    ///
    /// Stopping at the first failure keeps per-key order: a later event for the same
    /// variant is never published ahead of an earlier one.
    pub fn drain(&self) -> Result<RelayStats, RelayError> {
        let mut stats = RelayStats::default();
        loop {
            let batch = self.outbox.pending(self.batch_size)?;
            if batch.is_empty() {
                return Ok(stats);
            }
            let full = batch.len() == self.batch_size;

            for message in batch {
                let outbox_id = message.outbox_id;
                if let Err(e) = self.bus.publish(message.envelope) {
                    let err = format!("{e:?}");
                    warn!(outbox_id, attempts = message.attempts + 1, error = %err, "outbox publish failed");
                    self.outbox.record_failure(outbox_id, &err)?;
                    return Err(RelayError::Publish {
                        outbox_id,
                        message: err,
                    });
                }
                self.outbox.mark_published(outbox_id, Utc::now())?;
                stats.published += 1;
            }

            if !full {
                debug!(published = stats.published, "outbox drained");
                return Ok(stats);
            }
        }
    }

    /// Run `drain` on a background thread with the given schedule.
    pub fn spawn(self, schedule: &PeriodicRunner) -> std::io::Result<PeriodicHandle>
    where
        O: Send,
        B: Send,
    {
        schedule.spawn("outbox-relay", move || self.drain().map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use stockledger_core::{StaffId, VariantId};
    use stockledger_events::InMemoryEventBus;
    use stockledger_inventory::{TransactionRequest, TransactionType};

    use crate::applier::TransactionApplier;
    use crate::store::{InMemoryStockStore, StockStore};

    fn restock(applier: &TransactionApplier<Arc<InMemoryStockStore>>, qty: i64) {
        let staff = StaffId::new("s").unwrap();
        applier
            .apply(TransactionRequest::new(TransactionType::Restock, VariantId::new(1), qty, staff))
            .unwrap();
    }

    #[test]
    fn publishes_in_order_and_marks_rows() {
        let store = Arc::new(InMemoryStockStore::new());
        let applier = TransactionApplier::new(store.clone());
        restock(&applier, 5);
        restock(&applier, 7);

        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let relay = OutboxRelay::new(store.clone(), bus.clone(), 1);

        assert_eq!(relay.drain().unwrap().published, 2);
        assert!(store.pending(10).unwrap().is_empty());

        let first = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(first.sequence_number() < second.sequence_number());
    }

    #[test]
    fn failed_publish_is_recorded_and_retried() {
        let store = Arc::new(InMemoryStockStore::new());
        let applier = TransactionApplier::new(store.clone());
        restock(&applier, 5);

        let bus = Arc::new(InMemoryEventBus::new());
        bus.set_offline(true);
        let relay = OutboxRelay::new(store.clone(), bus.clone(), 10);

        assert!(matches!(relay.drain(), Err(RelayError::Publish { .. })));
        let pending = store.pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());

        // Stock stayed committed while the bus was down.
        assert_eq!(store.ledger(VariantId::new(1)).unwrap().len(), 1);

        bus.set_offline(false);
        assert_eq!(relay.drain().unwrap().published, 1);
    }
}
