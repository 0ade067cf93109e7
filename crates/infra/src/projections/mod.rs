//! Read-model projections over published stock events.

pub mod stock_summary;

pub use stock_summary::{
    ProjectionError, RegionKey, RegionTotal, SnapshotKey, StockSnapshot, StockSummaryProjection,
};
