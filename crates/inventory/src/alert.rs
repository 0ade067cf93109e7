//! Reorder alerts and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{AlertId, DealerId, DomainError, DomainResult, VariantId};

use crate::stock::{CentralStock, DealerAllocation};
use crate::transaction::StockScope;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    LowStock,
    OutOfStock,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::LowStock => "LOW_STOCK",
            AlertType::OutOfStock => "OUT_OF_STOCK",
        }
    }

    pub fn for_level(current_stock: i64) -> Self {
        if current_stock <= 0 {
            AlertType::OutOfStock
        } else {
            AlertType::LowStock
        }
    }
}

impl core::str::FromStr for AlertType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW_STOCK" => Ok(AlertType::LowStock),
            "OUT_OF_STOCK" => Ok(AlertType::OutOfStock),
            other => Err(DomainError::validation(format!("unknown alert type '{other}'"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "NEW",
            AlertStatus::Acknowledged => "ACKNOWLEDGED",
            AlertStatus::Resolved => "RESOLVED",
        }
    }

    /// Allowed moves: NEW → ACKNOWLEDGED → RESOLVED, and NEW → RESOLVED.
    pub fn can_move_to(self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::New, AlertStatus::Acknowledged)
                | (AlertStatus::New, AlertStatus::Resolved)
                | (AlertStatus::Acknowledged, AlertStatus::Resolved)
        )
    }
}

impl core::str::FromStr for AlertStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(AlertStatus::New),
            "ACKNOWLEDGED" => Ok(AlertStatus::Acknowledged),
            "RESOLVED" => Ok(AlertStatus::Resolved),
            other => Err(DomainError::validation(format!("unknown alert status '{other}'"))),
        }
    }
}

/// A key at or below its reorder level, as seen by one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertCandidate {
    pub variant_id: VariantId,
    pub scope: StockScope,
    pub current_stock: i64,
    pub threshold: i64,
}

impl AlertCandidate {
    /// A zero reorder level means no threshold is configured.
    fn check(variant_id: VariantId, scope: StockScope, available: i64, level: i64) -> Option<Self> {
        (level > 0 && available <= level).then_some(Self {
            variant_id,
            scope,
            current_stock: available,
            threshold: level,
        })
    }

    pub fn from_central(row: &CentralStock) -> Option<Self> {
        Self::check(
            row.variant_id(),
            StockScope::Central,
            row.available_quantity(),
            row.reorder_level(),
        )
    }

    pub fn from_dealer(row: &DealerAllocation) -> Option<Self> {
        Self::check(
            row.variant_id(),
            StockScope::Dealer(row.dealer_id()),
            row.available_quantity(),
            row.reorder_level(),
        )
    }

    pub fn alert_type(&self) -> AlertType {
        AlertType::for_level(self.current_stock)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAlert {
    pub alert_id: AlertId,
    pub variant_id: VariantId,
    /// `None` for the central warehouse.
    pub dealer_id: Option<DealerId>,
    pub alert_type: AlertType,
    pub current_stock: i64,
    pub threshold: i64,
    pub alert_date: DateTime<Utc>,
    pub status: AlertStatus,
}

impl StockAlert {
    pub fn open(alert_id: AlertId, candidate: &AlertCandidate, alert_date: DateTime<Utc>) -> Self {
        Self {
            alert_id,
            variant_id: candidate.variant_id,
            dealer_id: candidate.scope.dealer_id(),
            alert_type: candidate.alert_type(),
            current_stock: candidate.current_stock,
            threshold: candidate.threshold,
            alert_date,
            status: AlertStatus::New,
        }
    }

    pub fn scope(&self) -> StockScope {
        StockScope::from_dealer(self.dealer_id)
    }

    pub fn is_open(&self) -> bool {
        self.status == AlertStatus::New
    }

    pub fn transition(&mut self, next: AlertStatus) -> DomainResult<()> {
        if !self.status.can_move_to(next) {
            return Err(DomainError::validation(format!(
                "alert {} cannot move from {} to {}",
                self.alert_id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_need_a_configured_threshold() {
        let mut c = CentralStock::empty(VariantId::new(3));
        assert!(AlertCandidate::from_central(&c).is_none());

        c.set_reorder_level(5).unwrap();
        let cand = AlertCandidate::from_central(&c).unwrap();
        assert_eq!(cand.alert_type(), AlertType::OutOfStock);

        c.receive(5).unwrap();
        assert_eq!(AlertCandidate::from_central(&c).unwrap().alert_type(), AlertType::LowStock);

        c.receive(1).unwrap();
        assert!(AlertCandidate::from_central(&c).is_none());
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        let mut d = DealerAllocation::empty(DealerId::new(2), VariantId::new(3));
        d.set_reorder_level(1).unwrap();
        let cand = AlertCandidate::from_dealer(&d).unwrap();
        let mut alert = StockAlert::open(AlertId::new(1), &cand, Utc::now());
        assert_eq!(alert.scope(), StockScope::Dealer(DealerId::new(2)));
        assert!(alert.is_open());

        alert.transition(AlertStatus::Acknowledged).unwrap();
        assert!(alert.transition(AlertStatus::New).is_err());
        alert.transition(AlertStatus::Resolved).unwrap();
        assert!(alert.transition(AlertStatus::Acknowledged).is_err());
    }
}
