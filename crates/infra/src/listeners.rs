//! Inbound bus listeners.
//!
//! Listeners call the same applier as request handlers, so bus-driven and
//! request-driven writes go through identical validation and retry.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use stockledger_events::{EventEnvelope, HandlerRegistry, MessageHandler};
use stockledger_inventory::event::ORDER_APPROVED;
use stockledger_inventory::OrderApproved;

use crate::applier::{AllocationOutcome, ApplyError, TransactionApplier};
use crate::store::StockStore;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to decode {event_type}: {message}")]
    Decode { event_type: String, message: String },

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Reserves central stock when an order is approved.
///
/// Redelivered events for an order that was already allocated are acknowledged
/// without writing anything.
#[derive(Debug)]
pub struct OrderApprovedHandler<S> {
    applier: Arc<TransactionApplier<S>>,
}

impl<S> OrderApprovedHandler<S> {
    pub fn new(applier: Arc<TransactionApplier<S>>) -> Self {
        Self { applier }
    }
}

impl<S: StockStore> MessageHandler for OrderApprovedHandler<S> {
    type Error = ListenerError;

    fn name(&self) -> &'static str {
        "order_approved_allocation"
    }

    fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ListenerError> {
        let order: OrderApproved = envelope.decode().map_err(|e| ListenerError::Decode {
            event_type: envelope.event_type().to_string(),
            message: e.to_string(),
        })?;

        match self
            .applier
            .allocate_for_order(&order.order_id, &order.items, &order.approved_by)
        {
            Ok(AllocationOutcome::Allocated(entries)) => {
                info!(order_id = %order.order_id, entries = entries.len(), "allocated stock for approved order");
                Ok(())
            }
            Ok(AllocationOutcome::AlreadyAllocated(_)) => Ok(()),
            Err(e) => {
                warn!(
                    order_id = %order.order_id,
                    transient = e.is_transient(),
                    error = %e,
                    "allocation for approved order failed"
                );
                Err(e.into())
            }
        }
    }
}

/// Registry with every inbound listener of the inventory core.
pub fn inventory_listeners<S>(applier: Arc<TransactionApplier<S>>) -> HandlerRegistry
where
    S: StockStore + 'static,
{
    let mut registry = HandlerRegistry::new();
    registry.register(ORDER_APPROVED, OrderApprovedHandler::new(applier));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use uuid::Uuid;

    use stockledger_core::{OrderId, StaffId, VariantId};
    use stockledger_inventory::{OrderLine, TransactionRequest, TransactionType};

    use crate::store::InMemoryStockStore;

    const V: VariantId = VariantId::new(1);

    fn approved(order: &str, qty: i64) -> EventEnvelope<JsonValue> {
        let event = OrderApproved {
            order_id: OrderId::new(order).unwrap(),
            items: vec![OrderLine { variant_id: V, quantity: qty }],
            approved_by: StaffId::new("approver").unwrap(),
            occurred_at: Utc::now(),
        };
        EventEnvelope::from_typed(Uuid::now_v7(), 1, &event).unwrap()
    }

    #[test]
    fn redelivered_order_allocates_once() {
        let store = Arc::new(InMemoryStockStore::new());
        let applier = Arc::new(TransactionApplier::new(store.clone()));
        applier
            .apply(TransactionRequest::new(TransactionType::Restock, V, 10, StaffId::new("s").unwrap()))
            .unwrap();

        let registry = inventory_listeners(applier);
        let envelope = approved("SO-9", 4);
        assert_eq!(registry.dispatch(&envelope).unwrap(), 1);
        assert_eq!(registry.dispatch(&envelope).unwrap(), 1);

        let central = store.load_central(V).unwrap().unwrap();
        assert_eq!(central.allocated_quantity(), 4);
    }

    #[test]
    fn insufficient_stock_surfaces_as_handler_error() {
        let store = Arc::new(InMemoryStockStore::new());
        let applier = Arc::new(TransactionApplier::new(store));
        applier
            .apply(TransactionRequest::new(TransactionType::Restock, V, 2, StaffId::new("s").unwrap()))
            .unwrap();

        let registry = inventory_listeners(applier);
        let errors = registry.dispatch(&approved("SO-10", 3)).unwrap_err();
        assert_eq!(errors[0].handler, "order_approved_allocation");
    }
}
