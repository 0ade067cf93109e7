//! Background threads: periodic jobs, bus consumers and the outbox relay.

pub mod outbox_relay;
pub mod periodic;
pub mod projection_worker;

pub use outbox_relay::{OutboxRelay, RelayError, RelayStats};
pub use periodic::{PeriodicHandle, PeriodicRunner};
pub use projection_worker::{ProjectionWorker, WorkerHandle};
