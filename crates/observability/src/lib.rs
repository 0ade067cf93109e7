//! Tracing and logging setup shared by the binaries.

/// Initialize process-wide tracing with default settings (info, JSON).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogSettings::default());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use tracing::{init as init_with, LogFormat, LogSettings};
