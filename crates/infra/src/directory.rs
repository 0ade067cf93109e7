//! In-process catalog and dealer directory, loaded at startup or seeded by tests.

use std::collections::HashMap;
use std::sync::RwLock;

use stockledger_core::{DealerId, VariantId};
use stockledger_inventory::{Catalog, DealerDirectory, DealerInfo, VariantInfo};

#[derive(Debug, Default)]
pub struct StaticCatalog {
    variants: RwLock<HashMap<VariantId, VariantInfo>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: VariantInfo) {
        let mut guard = self.variants.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(info.variant_id, info);
    }
}

impl Catalog for StaticCatalog {
    fn variant(&self, variant_id: VariantId) -> Option<VariantInfo> {
        let guard = self.variants.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&variant_id).cloned()
    }
}

#[derive(Debug, Default)]
pub struct StaticDealerDirectory {
    dealers: RwLock<HashMap<DealerId, DealerInfo>>,
}

impl StaticDealerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: DealerInfo) {
        let mut guard = self.dealers.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(info.dealer_id, info);
    }
}

impl DealerDirectory for StaticDealerDirectory {
    fn dealer(&self, dealer_id: DealerId) -> Option<DealerInfo> {
        let guard = self.dealers.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&dealer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_inventory::directory::UNKNOWN_REGION;

    #[test]
    fn unknown_dealers_fall_back_to_unassigned_region() {
        let dir = StaticDealerDirectory::new();
        dir.insert(DealerInfo {
            dealer_id: DealerId::new(1),
            name: "North Motors".to_string(),
            region: "NORTH".to_string(),
        });
        assert_eq!(dir.region_of(DealerId::new(1)), "NORTH");
        assert_eq!(dir.region_of(DealerId::new(2)), UNKNOWN_REGION);
    }
}
