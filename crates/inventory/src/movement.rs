//! Movement rules: how each transaction type changes the central and dealer rows.
//!
//! `plan` is pure. It receives the rows as currently stored (or `None` when a row
//! does not exist yet) and returns the rows to write back, keeping the loaded
//! versions so the store can do a conditional write.

use std::collections::BTreeMap;

use stockledger_core::{DealerId, DomainError, DomainResult, VariantId};

use crate::stock::{CentralStock, DealerAllocation};
use crate::transaction::{InventoryTransaction, TransactionRequest, TransactionType};

/// New state for the rows a transaction touches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StockChange {
    pub central: Option<CentralStock>,
    pub dealer: Option<DealerAllocation>,
}

/// Compute the effect of `request` on the given rows.
///
/// Validation and stock-sufficiency failures leave no partial result.
pub fn plan(
    request: &TransactionRequest,
    central: Option<CentralStock>,
    dealer: Option<DealerAllocation>,
) -> DomainResult<StockChange> {
    request.validate()?;
    check_keys(request, central.as_ref(), dealer.as_ref())?;

    let variant_id = request.variant_id;
    let qty = request.quantity;

    match request.transaction_type {
        TransactionType::InitialStock | TransactionType::Restock => {
            let mut c = central.unwrap_or_else(|| CentralStock::empty(variant_id));
            c.receive(qty)?;
            Ok(StockChange { central: Some(c), dealer: None })
        }
        TransactionType::Allocate => {
            let mut c = require_central(central, variant_id)?;
            c.reserve(qty)?;
            Ok(StockChange { central: Some(c), dealer: None })
        }
        TransactionType::TransferToDealer => {
            let dealer_id = dealer_of(request)?;
            let mut c = require_central(central, variant_id)?;
            let mut d = dealer.unwrap_or_else(|| DealerAllocation::empty(dealer_id, variant_id));
            c.ship_reserved(qty)?;
            d.receive_transfer(qty)?;
            Ok(StockChange { central: Some(c), dealer: Some(d) })
        }
        TransactionType::TransferToCentral => {
            let dealer_id = dealer_of(request)?;
            let mut d = require_dealer(dealer, dealer_id, variant_id)?;
            let mut c = central.unwrap_or_else(|| CentralStock::empty(variant_id));
            d.return_to_central(qty)?;
            c.return_from_dealer(qty)?;
            Ok(StockChange { central: Some(c), dealer: Some(d) })
        }
        TransactionType::Sale => {
            let dealer_id = dealer_of(request)?;
            let mut d = require_dealer(dealer, dealer_id, variant_id)?;
            d.sell(qty)?;
            Ok(StockChange { central: None, dealer: Some(d) })
        }
        TransactionType::AdjustmentAdd => match request.dealer_id() {
            Some(dealer_id) => {
                let mut d =
                    dealer.unwrap_or_else(|| DealerAllocation::empty(dealer_id, variant_id));
                d.adjust_add(qty)?;
                Ok(StockChange { central: None, dealer: Some(d) })
            }
            None => {
                let mut c = central.unwrap_or_else(|| CentralStock::empty(variant_id));
                c.receive(qty)?;
                Ok(StockChange { central: Some(c), dealer: None })
            }
        },
        TransactionType::AdjustmentSubtract => match request.dealer_id() {
            Some(dealer_id) => {
                let mut d = require_dealer(dealer, dealer_id, variant_id)?;
                d.adjust_subtract(qty)?;
                Ok(StockChange { central: None, dealer: Some(d) })
            }
            None => {
                let mut c = require_central(central, variant_id)?;
                c.write_off(qty)?;
                Ok(StockChange { central: Some(c), dealer: None })
            }
        },
    }
}

fn check_keys(
    request: &TransactionRequest,
    central: Option<&CentralStock>,
    dealer: Option<&DealerAllocation>,
) -> DomainResult<()> {
    if let Some(c) = central {
        if c.variant_id() != request.variant_id {
            return Err(DomainError::invariant(format!(
                "central row for variant {} passed for variant {}",
                c.variant_id(),
                request.variant_id
            )));
        }
    }
    if let Some(d) = dealer {
        if d.variant_id() != request.variant_id || Some(d.dealer_id()) != request.dealer_id() {
            return Err(DomainError::invariant(format!(
                "dealer row ({}, {}) does not match the request",
                d.dealer_id(),
                d.variant_id()
            )));
        }
    }
    Ok(())
}

fn dealer_of(request: &TransactionRequest) -> DomainResult<DealerId> {
    request.dealer_id().ok_or_else(|| {
        DomainError::validation(format!("{} requires a dealer id", request.transaction_type))
    })
}

fn require_central(central: Option<CentralStock>, variant_id: VariantId) -> DomainResult<CentralStock> {
    central.ok_or_else(|| {
        DomainError::unknown_reference(format!("no central stock for variant {variant_id}"))
    })
}

fn require_dealer(
    dealer: Option<DealerAllocation>,
    dealer_id: DealerId,
    variant_id: VariantId,
) -> DomainResult<DealerAllocation> {
    dealer.ok_or_else(|| {
        DomainError::unknown_reference(format!(
            "dealer {dealer_id} holds no stock for variant {variant_id}"
        ))
    })
}

/// Rows rebuilt from a variant's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Replayed {
    pub central: Option<CentralStock>,
    pub dealers: BTreeMap<DealerId, DealerAllocation>,
}

impl Replayed {
    /// Units held anywhere: central available + central allocated + dealer available.
    pub fn total_in_system(&self) -> i64 {
        let central = self.central.as_ref().map_or(0, CentralStock::on_hand);
        let dealers: i64 = self.dealers.values().map(DealerAllocation::available_quantity).sum();
        central + dealers
    }
}

/// Rebuild the stock rows of one variant by re-applying its ledger in order.
///
/// Thresholds and status tags are not part of the ledger and come back as defaults.
pub fn replay<'a>(
    variant_id: VariantId,
    entries: impl IntoIterator<Item = &'a InventoryTransaction>,
) -> DomainResult<Replayed> {
    let mut state = Replayed::default();

    for entry in entries {
        if entry.variant_id != variant_id {
            continue;
        }
        let request = TransactionRequest {
            transaction_type: entry.transaction_type,
            variant_id: entry.variant_id,
            quantity: entry.quantity,
            from_dealer_id: entry.from_dealer_id,
            to_dealer_id: entry.to_dealer_id,
            staff_id: entry.staff_id.clone(),
            reference_id: entry.reference_id.clone(),
            notes: None,
        };
        let dealer_id = request.dealer_id();
        let dealer = dealer_id.and_then(|d| state.dealers.get(&d).cloned());
        let change = plan(&request, state.central.clone(), dealer).map_err(|e| {
            DomainError::invariant(format!(
                "ledger entry {} cannot be replayed: {e}",
                entry.transaction_id
            ))
        })?;
        if let Some(c) = change.central {
            state.central = Some(c);
        }
        if let Some(d) = change.dealer {
            state.dealers.insert(d.dealer_id(), d);
        }
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use stockledger_core::{StaffId, TransactionId};

    use crate::transaction::ledger_net_total;

    const V: VariantId = VariantId::new(10);
    const D1: DealerId = DealerId::new(1);

    fn staff() -> StaffId {
        StaffId::new("staff-7").unwrap()
    }

    fn req(kind: TransactionType, qty: i64) -> TransactionRequest {
        TransactionRequest::new(kind, V, qty, staff())
    }

    fn apply(state: &mut Replayed, request: &TransactionRequest) -> DomainResult<()> {
        let dealer = request.dealer_id().and_then(|d| state.dealers.get(&d).cloned());
        let change = plan(request, state.central.clone(), dealer)?;
        if let Some(c) = change.central {
            state.central = Some(c);
        }
        if let Some(d) = change.dealer {
            state.dealers.insert(d.dealer_id(), d);
        }
        Ok(())
    }

    #[test]
    fn restock_allocate_transfer_sell_scenario() {
        let mut s = Replayed::default();
        apply(&mut s, &req(TransactionType::Restock, 100)).unwrap();
        assert_eq!(s.central.as_ref().unwrap().available_quantity(), 100);

        apply(&mut s, &req(TransactionType::Allocate, 30)).unwrap();
        let c = s.central.as_ref().unwrap();
        assert_eq!((c.available_quantity(), c.allocated_quantity()), (70, 30));

        apply(&mut s, &req(TransactionType::TransferToDealer, 30).to_dealer(D1)).unwrap();
        let c = s.central.as_ref().unwrap();
        assert_eq!(c.allocated_quantity(), 0);
        let d = &s.dealers[&D1];
        assert_eq!((d.allocated_quantity(), d.available_quantity()), (30, 30));

        apply(&mut s, &req(TransactionType::Sale, 5).from_dealer(D1)).unwrap();
        assert_eq!(s.dealers[&D1].available_quantity(), 25);
        assert_eq!(s.total_in_system(), 95);

        let err = apply(&mut s, &req(TransactionType::Sale, 30).from_dealer(D1)).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock { requested: 30, available: 25, .. }));
        assert_eq!(s.dealers[&D1].available_quantity(), 25);
    }

    #[test]
    fn referential_gaps_follow_type() {
        assert!(matches!(
            plan(&req(TransactionType::Allocate, 1), None, None),
            Err(DomainError::UnknownReference(_))
        ));
        assert!(matches!(
            plan(&req(TransactionType::Sale, 1).from_dealer(D1), None, None),
            Err(DomainError::UnknownReference(_))
        ));
        assert!(matches!(
            plan(&req(TransactionType::TransferToDealer, 1).to_dealer(D1), None, None),
            Err(DomainError::UnknownReference(_))
        ));
        let change = plan(&req(TransactionType::AdjustmentAdd, 2).to_dealer(D1), None, None).unwrap();
        assert!(change.central.is_none());
        assert_eq!(change.dealer.unwrap().available_quantity(), 2);
    }

    #[test]
    fn return_to_central_creates_the_warehouse_row() {
        let found = plan(&req(TransactionType::AdjustmentAdd, 3).to_dealer(D1), None, None).unwrap();
        let change = plan(
            &req(TransactionType::TransferToCentral, 2).from_dealer(D1),
            None,
            found.dealer,
        )
        .unwrap();

        let c = change.central.unwrap();
        assert_eq!((c.available_quantity(), c.allocated_quantity()), (2, 0));
        assert_eq!(c.total_imported(), 2);
        assert_eq!(change.dealer.unwrap().available_quantity(), 1);
    }

    #[test]
    fn mismatched_rows_are_rejected() {
        let other = CentralStock::empty(VariantId::new(99));
        assert!(matches!(
            plan(&req(TransactionType::Restock, 1), Some(other), None),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn replay_rebuilds_rows_from_ledger() {
        let now = Utc::now();
        let entries: Vec<_> = [
            req(TransactionType::InitialStock, 40),
            req(TransactionType::Allocate, 10),
            req(TransactionType::TransferToDealer, 10).to_dealer(D1),
            req(TransactionType::Sale, 4).from_dealer(D1),
            req(TransactionType::TransferToCentral, 2).from_dealer(D1),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, r)| InventoryTransaction::record(TransactionId::new(i as u64 + 1), r, now))
        .collect();

        let state = replay(V, &entries).unwrap();
        let c = state.central.as_ref().unwrap();
        assert_eq!((c.available_quantity(), c.allocated_quantity()), (32, 0));
        let d = &state.dealers[&D1];
        assert_eq!((d.allocated_quantity(), d.available_quantity()), (8, 4));
        assert_eq!(state.total_in_system(), ledger_net_total(&entries));
    }

    fn arb_request() -> impl Strategy<Value = TransactionRequest> {
        let dealer = prop_oneof![Just(None), (1i64..4).prop_map(|d| Some(DealerId::new(d)))];
        (0usize..TransactionType::ALL.len(), 1i64..40, dealer).prop_map(|(k, qty, dealer)| {
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
        fn applied_ledger_conserves_units(requests in proptest::collection::vec(arb_request(), 1..80)) {
            let mut state = Replayed::default();
            let mut ledger = Vec::new();
            let now = Utc::now();

            for r in requests {
                if apply(&mut state, &r).is_ok() {
                    let id = TransactionId::new(ledger.len() as u64 + 1);
                    ledger.push(InventoryTransaction::record(id, r, now));
                }
                if let Some(c) = &state.central {
                    prop_assert!(c.available_quantity() >= 0);
                    prop_assert!(c.allocated_quantity() <= c.total_imported());
                }
                for d in state.dealers.values() {
                    prop_assert!(d.available_quantity() >= 0);
                    prop_assert!(d.available_quantity() <= d.allocated_quantity());
                }
            }

            prop_assert_eq!(state.total_in_system(), ledger_net_total(&ledger));
            let replayed = replay(V, &ledger).unwrap();
            prop_assert_eq!(replayed.total_in_system(), state.total_in_system());
        }
    }
}
