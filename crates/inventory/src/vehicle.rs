//! VIN-tracked vehicles and the multi-step transfer workflow.
//!
//! A vehicle has exactly one location and one status at a time. Transfer requests
//! only move forward; delivery is the point where the quantity ledger is touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{DomainError, DomainResult, StaffId, VariantId};

use crate::transaction::{StockScope, TransactionRequest, TransactionType};

/// 17-character vehicle identification number (letters I, O and Q are never used).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Vin(String);

impl Vin {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let vin = raw.trim().to_ascii_uppercase();
        let valid = vin.len() == 17
            && vin
                .chars()
                .all(|c| c.is_ascii_alphanumeric() && !matches!(c, 'I' | 'O' | 'Q'));
        if !valid {
            return Err(DomainError::invalid_id(format!("'{raw}' is not a valid VIN")));
        }
        Ok(Self(vin))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Vin {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Vin::parse(&value)
    }
}

impl From<Vin> for String {
    fn from(value: Vin) -> Self {
        value.0
    }
}

impl core::fmt::Display for Vin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStatus {
    InStock,
    InTransit,
    Sold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVehicle {
    vin: Vin,
    variant_id: VariantId,
    location: StockScope,
    status: VehicleStatus,
    updated_at: DateTime<Utc>,
}

impl PhysicalVehicle {
    /// A newly received unit sits in the central warehouse.
    pub fn received(vin: Vin, variant_id: VariantId, at: DateTime<Utc>) -> Self {
        Self {
            vin,
            variant_id,
            location: StockScope::Central,
            status: VehicleStatus::InStock,
            updated_at: at,
        }
    }

    pub fn vin(&self) -> &Vin {
        &self.vin
    }

    pub fn variant_id(&self) -> VariantId {
        self.variant_id
    }

    pub fn location(&self) -> StockScope {
        self.location
    }

    pub fn status(&self) -> VehicleStatus {
        self.status
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Leave the current location; the location stays the origin until delivery.
    pub fn dispatch(&mut self, from: StockScope, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != VehicleStatus::InStock || self.location != from {
            return Err(DomainError::validation(format!(
                "vehicle {} is not in stock at {from}",
                self.vin
            )));
        }
        self.status = VehicleStatus::InTransit;
        self.updated_at = at;
        Ok(())
    }

    pub fn arrive(&mut self, to: StockScope, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != VehicleStatus::InTransit {
            return Err(DomainError::validation(format!("vehicle {} is not in transit", self.vin)));
        }
        self.location = to;
        self.status = VehicleStatus::InStock;
        self.updated_at = at;
        Ok(())
    }

    /// Only dealers sell to customers.
    pub fn sell(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != VehicleStatus::InStock || self.location == StockScope::Central {
            return Err(DomainError::validation(format!(
                "vehicle {} must be in stock at a dealer to be sold",
                self.vin
            )));
        }
        self.status = VehicleStatus::Sold;
        self.updated_at = at;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Confirmed,
    InTransit,
    Delivered,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Delivered | TransferStatus::Cancelled)
    }

    fn next(self) -> Option<TransferStatus> {
        match self {
            TransferStatus::Pending => Some(TransferStatus::Confirmed),
            TransferStatus::Confirmed => Some(TransferStatus::InTransit),
            TransferStatus::InTransit => Some(TransferStatus::Delivered),
            TransferStatus::Delivered | TransferStatus::Cancelled => None,
        }
    }
}

/// Request to move units between the warehouse and a dealer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub request_id: Uuid,
    pub variant_id: VariantId,
    pub from: StockScope,
    pub to: StockScope,
    pub vins: Vec<Vin>,
    pub requested_by: StaffId,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRequest {
    /// Exactly one side must be the central warehouse.
    pub fn open(
        variant_id: VariantId,
        from: StockScope,
        to: StockScope,
        vins: Vec<Vin>,
        requested_by: StaffId,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let central_sides = [from, to].iter().filter(|s| **s == StockScope::Central).count();
        if central_sides != 1 {
            return Err(DomainError::validation(
                "a transfer moves units between the central warehouse and one dealer",
            ));
        }
        if vins.is_empty() {
            return Err(DomainError::validation("a transfer needs at least one VIN"));
        }
        let mut unique = vins.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != vins.len() {
            return Err(DomainError::validation("a VIN appears twice in the transfer"));
        }

        Ok(Self {
            request_id: Uuid::now_v7(),
            variant_id,
            from,
            to,
            vins,
            requested_by,
            status: TransferStatus::Pending,
            created_at: at,
            updated_at: at,
        })
    }

    pub fn quantity(&self) -> i64 {
        self.vins.len() as i64
    }

    /// Advance one step along PENDING → CONFIRMED → IN_TRANSIT → DELIVERED.
    pub fn advance(&mut self, expected: TransferStatus, at: DateTime<Utc>) -> DomainResult<()> {
        match self.status.next() {
            Some(next) if next == expected => {
                self.status = next;
                self.updated_at = at;
                Ok(())
            }
            _ => Err(DomainError::validation(format!(
                "transfer {} cannot move from {:?} to {:?}",
                self.request_id, self.status, expected
            ))),
        }
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::validation(format!(
                "transfer {} is already {:?}",
                self.request_id, self.status
            )));
        }
        self.status = TransferStatus::Cancelled;
        self.updated_at = at;
        Ok(())
    }

    /// Ledger entries to apply, in order and as one unit, when the transfer is delivered.
    ///
    /// Outbound units are reserved first so the transfer ships from allocated stock.
    pub fn ledger_requests(&self, staff_id: StaffId) -> Vec<TransactionRequest> {
        let qty = self.quantity();
        let reference = self.request_id.to_string();
        match (self.from, self.to) {
            (StockScope::Central, StockScope::Dealer(dealer)) => vec![
                TransactionRequest::new(TransactionType::Allocate, self.variant_id, qty, staff_id.clone())
                    .with_reference(reference.clone()),
                TransactionRequest::new(TransactionType::TransferToDealer, self.variant_id, qty, staff_id)
                    .to_dealer(dealer)
                    .with_reference(reference),
            ],
            (StockScope::Dealer(dealer), _) => vec![
                TransactionRequest::new(TransactionType::TransferToCentral, self.variant_id, qty, staff_id)
                    .from_dealer(dealer)
                    .with_reference(reference),
            ],
            (StockScope::Central, StockScope::Central) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::DealerId;

    fn vin(n: u8) -> Vin {
        Vin::parse(&format!("1HGCM82633A00{n:04}")).unwrap()
    }

    fn staff() -> StaffId {
        StaffId::new("ops").unwrap()
    }

    #[test]
    fn vin_format_is_checked() {
        assert!(Vin::parse("1hgcm82633a004352").is_ok());
        assert!(Vin::parse("1HGCM82633A00435").is_err());
        assert!(Vin::parse("1HGCM82633I004352").is_err());
    }

    #[test]
    fn vehicle_has_one_location_at_a_time() {
        let now = Utc::now();
        let dealer = StockScope::Dealer(DealerId::new(3));
        let mut v = PhysicalVehicle::received(vin(1), VariantId::new(1), now);
        assert!(v.sell(now).is_err());
        assert!(v.dispatch(dealer, now).is_err());
        v.dispatch(StockScope::Central, now).unwrap();
        assert!(v.dispatch(StockScope::Central, now).is_err());
        v.arrive(dealer, now).unwrap();
        assert_eq!((v.location(), v.status()), (dealer, VehicleStatus::InStock));
        v.sell(now).unwrap();
        assert!(v.dispatch(dealer, now).is_err());
    }

    #[test]
    fn transfer_moves_forward_only() {
        let now = Utc::now();
        let mut t = TransferRequest::open(
            VariantId::new(1),
            StockScope::Central,
            StockScope::Dealer(DealerId::new(2)),
            vec![vin(1), vin(2)],
            staff(),
            now,
        )
        .unwrap();
        assert!(t.advance(TransferStatus::InTransit, now).is_err());
        t.advance(TransferStatus::Confirmed, now).unwrap();
        t.advance(TransferStatus::InTransit, now).unwrap();
        t.advance(TransferStatus::Delivered, now).unwrap();
        assert!(t.cancel(now).is_err());

        let ledger = t.ledger_requests(staff());
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[1].transaction_type, TransactionType::TransferToDealer);
        assert_eq!(ledger[1].quantity, 2);
    }

    #[test]
    fn transfers_need_the_warehouse_on_one_side() {
        let now = Utc::now();
        let d = |n| StockScope::Dealer(DealerId::new(n));
        assert!(TransferRequest::open(VariantId::new(1), d(1), d(2), vec![vin(1)], staff(), now).is_err());
        assert!(
            TransferRequest::open(VariantId::new(1), d(1), StockScope::Central, vec![vin(1), vin(1)], staff(), now)
                .is_err()
        );
        let mut t =
            TransferRequest::open(VariantId::new(1), d(1), StockScope::Central, vec![vin(1)], staff(), now).unwrap();
        t.cancel(now).unwrap();
        assert_eq!(t.status, TransferStatus::Cancelled);
    }
}
