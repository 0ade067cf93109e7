//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `stockledger-events` as pure mechanics; this module
//! provides transport-backed implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsEventBus};
