//! Event mechanics: envelopes, bus, projections and inbound handler routing.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod projection;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::{HandlerError, HandlerRegistry, MessageHandler};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use projection::{Applied, Projection};
