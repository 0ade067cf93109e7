//! Disposable key/value storage for projection read models.

pub mod store;

pub use store::{InMemoryReadModelStore, ReadModelStore};
