//! Collaborators resolving display data for variants and dealers.
//!
//! Neither is consulted for allocation math; they only enrich views and events.

use serde::{Deserialize, Serialize};

use stockledger_core::{DealerId, VariantId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantInfo {
    pub variant_id: VariantId,
    pub model_name: String,
    pub variant_name: String,
}

impl VariantInfo {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.model_name, self.variant_name)
    }

    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        needle.is_empty() || self.display_name().to_lowercase().contains(&needle)
    }
}

/// Region used for central-warehouse rows in regional rollups.
pub const CENTRAL_REGION: &str = "CENTRAL";

/// Region used when the directory does not know a dealer.
pub const UNKNOWN_REGION: &str = "UNASSIGNED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealerInfo {
    pub dealer_id: DealerId,
    pub name: String,
    pub region: String,
}

pub trait Catalog: Send + Sync {
    fn variant(&self, variant_id: VariantId) -> Option<VariantInfo>;
}

pub trait DealerDirectory: Send + Sync {
    fn dealer(&self, dealer_id: DealerId) -> Option<DealerInfo>;

    fn region_of(&self, dealer_id: DealerId) -> String {
        self.dealer(dealer_id)
            .map(|d| d.region)
            .unwrap_or_else(|| UNKNOWN_REGION.to_string())
    }
}

impl<T: Catalog + ?Sized> Catalog for std::sync::Arc<T> {
    fn variant(&self, variant_id: VariantId) -> Option<VariantInfo> {
        (**self).variant(variant_id)
    }
}

impl<T: DealerDirectory + ?Sized> DealerDirectory for std::sync::Arc<T> {
    fn dealer(&self, dealer_id: DealerId) -> Option<DealerInfo> {
        (**self).dealer(dealer_id)
    }
}
