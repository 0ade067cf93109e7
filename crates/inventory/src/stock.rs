//! Stock aggregates: the central warehouse row per variant and the per-dealer rows.
//!
//! Both are plain mutable rows guarded by a version column. Mutators enforce the
//! row invariants and never touch the version; the store bumps it on commit.

use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateRoot, DealerId, DomainError, DomainResult, VariantId};

use crate::transaction::StockScope;

/// Condition tag given to dealer rows created without an explicit one.
pub const DEFAULT_DEALER_STATUS: &str = "new";

/// Central warehouse stock for one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CentralStock {
    variant_id: VariantId,
    total_imported: i64,
    allocated_quantity: i64,
    available_quantity: i64,
    reorder_level: i64,
    version: u64,
}

impl CentralStock {
    /// Zero-stock row that has never been persisted.
    pub fn empty(variant_id: VariantId) -> Self {
        Self {
            variant_id,
            total_imported: 0,
            allocated_quantity: 0,
            available_quantity: 0,
            reorder_level: 0,
            version: 0,
        }
    }

    /// Rehydrate a stored row, rejecting values that break the row invariants.
    pub fn restore(
        variant_id: VariantId,
        total_imported: i64,
        allocated_quantity: i64,
        available_quantity: i64,
        reorder_level: i64,
        version: u64,
    ) -> DomainResult<Self> {
        let row = Self {
            variant_id,
            total_imported,
            allocated_quantity,
            available_quantity,
            reorder_level,
            version,
        };
        row.check_invariants()?;
        Ok(row)
    }

    pub fn variant_id(&self) -> VariantId {
        self.variant_id
    }

    pub fn total_imported(&self) -> i64 {
        self.total_imported
    }

    pub fn allocated_quantity(&self) -> i64 {
        self.allocated_quantity
    }

    pub fn available_quantity(&self) -> i64 {
        self.available_quantity
    }

    pub fn reorder_level(&self) -> i64 {
        self.reorder_level
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    /// Copy of this row stamped with the version the store assigned.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Units physically present at the warehouse (reserved or not).
    pub fn on_hand(&self) -> i64 {
        self.available_quantity + self.allocated_quantity
    }

    /// INITIAL_STOCK / RESTOCK / central ADJUSTMENT_ADD.
    pub fn receive(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        self.total_imported = checked_add(self.total_imported, quantity)?;
        self.available_quantity = checked_add(self.available_quantity, quantity)?;
        Ok(())
    }

    /// ALLOCATE: move units from available to reserved.
    pub fn reserve(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        if self.available_quantity < quantity {
            return Err(DomainError::insufficient(
                StockScope::Central.to_string(),
                quantity,
                self.available_quantity,
            ));
        }
        self.available_quantity -= quantity;
        self.allocated_quantity += quantity;
        Ok(())
    }

    /// TRANSFER_TO_DEALER: reserved units leave the warehouse.
    pub fn ship_reserved(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        if self.allocated_quantity < quantity {
            return Err(DomainError::insufficient(
                format!("{} (allocated)", StockScope::Central),
                quantity,
                self.allocated_quantity,
            ));
        }
        self.allocated_quantity -= quantity;
        Ok(())
    }

    /// TRANSFER_TO_CENTRAL: units come back from a dealer and become available.
    ///
    /// Units a dealer found by adjustment never passed through the warehouse; once they
    /// arrive they count as imported so the warehouse never holds more than it received.
    pub fn return_from_dealer(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        self.available_quantity = checked_add(self.available_quantity, quantity)?;
        self.total_imported = self.total_imported.max(self.on_hand());
        Ok(())
    }

    /// Central ADJUSTMENT_SUBTRACT.
    pub fn write_off(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        if self.available_quantity < quantity {
            return Err(DomainError::insufficient(
                StockScope::Central.to_string(),
                quantity,
                self.available_quantity,
            ));
        }
        self.available_quantity -= quantity;
        Ok(())
    }

    pub fn set_reorder_level(&mut self, reorder_level: i64) -> DomainResult<()> {
        self.reorder_level = non_negative_threshold(reorder_level)?;
        Ok(())
    }

    fn check_invariants(&self) -> DomainResult<()> {
        if self.available_quantity < 0 || self.allocated_quantity < 0 || self.reorder_level < 0 {
            return Err(DomainError::invariant(format!(
                "central stock for variant {} has negative quantities",
                self.variant_id
            )));
        }
        if self.allocated_quantity > self.total_imported {
            return Err(DomainError::invariant(format!(
                "central stock for variant {}: allocated {} exceeds total imported {}",
                self.variant_id, self.allocated_quantity, self.total_imported
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for CentralStock {
    type Id = VariantId;

    fn id(&self) -> Self::Id {
        self.variant_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Stock assigned to one dealer for one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealerAllocation {
    dealer_id: DealerId,
    variant_id: VariantId,
    allocated_quantity: i64,
    available_quantity: i64,
    reorder_level: i64,
    status: String,
    version: u64,
}

impl DealerAllocation {
    pub fn empty(dealer_id: DealerId, variant_id: VariantId) -> Self {
        Self {
            dealer_id,
            variant_id,
            allocated_quantity: 0,
            available_quantity: 0,
            reorder_level: 0,
            status: DEFAULT_DEALER_STATUS.to_string(),
            version: 0,
        }
    }

    pub fn restore(
        dealer_id: DealerId,
        variant_id: VariantId,
        allocated_quantity: i64,
        available_quantity: i64,
        reorder_level: i64,
        status: impl Into<String>,
        version: u64,
    ) -> DomainResult<Self> {
        let row = Self {
            dealer_id,
            variant_id,
            allocated_quantity,
            available_quantity,
            reorder_level,
            status: status.into(),
            version,
        };
        row.check_invariants()?;
        Ok(row)
    }

    pub fn dealer_id(&self) -> DealerId {
        self.dealer_id
    }

    pub fn variant_id(&self) -> VariantId {
        self.variant_id
    }

    pub fn allocated_quantity(&self) -> i64 {
        self.allocated_quantity
    }

    pub fn available_quantity(&self) -> i64 {
        self.available_quantity
    }

    pub fn reorder_level(&self) -> i64 {
        self.reorder_level
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    fn scope(&self) -> String {
        StockScope::Dealer(self.dealer_id).to_string()
    }

    /// TRANSFER_TO_DEALER: units arrive and are immediately sellable.
    pub fn receive_transfer(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        self.allocated_quantity = checked_add(self.allocated_quantity, quantity)?;
        self.available_quantity = checked_add(self.available_quantity, quantity)?;
        Ok(())
    }

    /// TRANSFER_TO_CENTRAL: unsold units go back to the warehouse.
    pub fn return_to_central(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        self.ensure_available(quantity)?;
        self.allocated_quantity -= quantity;
        self.available_quantity -= quantity;
        Ok(())
    }

    /// SALE: the allocation stays as the historical assignment.
    pub fn sell(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        self.ensure_available(quantity)?;
        self.available_quantity -= quantity;
        Ok(())
    }

    /// Dealer ADJUSTMENT_ADD; raises the allocation alongside so `available <= allocated` holds.
    pub fn adjust_add(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        self.allocated_quantity = checked_add(self.allocated_quantity, quantity)?;
        self.available_quantity = checked_add(self.available_quantity, quantity)?;
        Ok(())
    }

    /// Dealer ADJUSTMENT_SUBTRACT.
    pub fn adjust_subtract(&mut self, quantity: i64) -> DomainResult<()> {
        positive(quantity)?;
        self.ensure_available(quantity)?;
        self.available_quantity -= quantity;
        Ok(())
    }

    pub fn set_reorder_level(&mut self, reorder_level: i64) -> DomainResult<()> {
        self.reorder_level = non_negative_threshold(reorder_level)?;
        Ok(())
    }

    pub fn set_status(&mut self, status: impl Into<String>) -> DomainResult<()> {
        let status = status.into();
        let status = status.trim();
        if status.is_empty() {
            return Err(DomainError::validation("dealer stock status cannot be empty"));
        }
        self.status = status.to_ascii_lowercase();
        Ok(())
    }

    fn ensure_available(&self, quantity: i64) -> DomainResult<()> {
        if self.available_quantity < quantity {
            return Err(DomainError::insufficient(
                self.scope(),
                quantity,
                self.available_quantity,
            ));
        }
        Ok(())
    }

    fn check_invariants(&self) -> DomainResult<()> {
        if self.available_quantity < 0 || self.reorder_level < 0 {
            return Err(DomainError::invariant(format!(
                "dealer {} stock for variant {} has negative quantities",
                self.dealer_id, self.variant_id
            )));
        }
        if self.available_quantity > self.allocated_quantity {
            return Err(DomainError::invariant(format!(
                "dealer {} stock for variant {}: available {} exceeds allocated {}",
                self.dealer_id, self.variant_id, self.available_quantity, self.allocated_quantity
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for DealerAllocation {
    type Id = (DealerId, VariantId);

    fn id(&self) -> Self::Id {
        (self.dealer_id, self.variant_id)
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn positive(quantity: i64) -> DomainResult<()> {
    if quantity <= 0 {
        return Err(DomainError::validation(format!(
            "quantity must be positive (got {quantity})"
        )));
    }
    Ok(())
}

fn checked_add(current: i64, quantity: i64) -> DomainResult<i64> {
    current
        .checked_add(quantity)
        .ok_or_else(|| DomainError::validation("quantity overflows stock counter"))
}

fn non_negative_threshold(level: i64) -> DomainResult<i64> {
    if level < 0 {
        return Err(DomainError::validation(format!(
            "reorder level must be zero or positive (got {level})"
        )));
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_reserve_and_ship() {
        let mut c = CentralStock::empty(VariantId::new(10));
        c.receive(100).unwrap();
        c.reserve(30).unwrap();
        assert_eq!((c.available_quantity(), c.allocated_quantity()), (70, 30));
        c.ship_reserved(30).unwrap();
        assert_eq!((c.available_quantity(), c.allocated_quantity()), (70, 0));
        assert_eq!(c.total_imported(), 100);
    }

    #[test]
    fn central_reserve_rejects_more_than_available() {
        let mut c = CentralStock::empty(VariantId::new(1));
        c.receive(5).unwrap();
        let err = c.reserve(6).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InsufficientStock { requested: 6, available: 5, .. }
        ));
        assert_eq!(c.available_quantity(), 5);
    }

    #[test]
    fn ship_requires_reserved_units() {
        let mut c = CentralStock::empty(VariantId::new(1));
        c.receive(50).unwrap();
        assert!(c.ship_reserved(1).is_err());
    }

    #[test]
    fn returned_surplus_counts_as_imported() {
        let mut c = CentralStock::empty(VariantId::new(1));
        c.receive(1).unwrap();
        c.return_from_dealer(5).unwrap();
        assert_eq!(c.total_imported(), 6);
        c.reserve(6).unwrap();
        assert!(CentralStock::restore(VariantId::new(1), 6, 6, 0, 0, 1).is_ok());

        let mut c = CentralStock::empty(VariantId::new(2));
        c.receive(100).unwrap();
        c.reserve(30).unwrap();
        c.ship_reserved(30).unwrap();
        c.return_from_dealer(10).unwrap();
        assert_eq!(c.total_imported(), 100);
    }

    #[test]
    fn dealer_sale_keeps_allocation() {
        let mut d = DealerAllocation::empty(DealerId::new(1), VariantId::new(10));
        d.receive_transfer(30).unwrap();
        d.sell(5).unwrap();
        assert_eq!((d.allocated_quantity(), d.available_quantity()), (30, 25));
        assert!(d.sell(30).is_err());
        assert_eq!(d.available_quantity(), 25);
    }

    #[test]
    fn restore_rejects_broken_rows() {
        assert!(CentralStock::restore(VariantId::new(1), 10, 11, 0, 0, 1).is_err());
        assert!(CentralStock::restore(VariantId::new(1), 10, 2, -1, 0, 1).is_err());
        assert!(
            DealerAllocation::restore(DealerId::new(1), VariantId::new(1), 3, 4, 0, "new", 1)
                .is_err()
        );
        assert!(
            DealerAllocation::restore(DealerId::new(1), VariantId::new(1), 4, 3, 2, "used", 1)
                .is_ok()
        );
    }

    #[test]
    fn thresholds_and_status_are_validated() {
        let mut d = DealerAllocation::empty(DealerId::new(1), VariantId::new(1));
        assert_eq!(d.status(), DEFAULT_DEALER_STATUS);
        assert!(d.set_reorder_level(-1).is_err());
        d.set_reorder_level(3).unwrap();
        assert!(d.set_status("  ").is_err());
        d.set_status("Repaired").unwrap();
        assert_eq!(d.status(), "repaired");
    }
}
