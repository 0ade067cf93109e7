//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes messages that have already been made durable elsewhere
//! (the stock outbox). Its contract is deliberately weak:
//!
//! - **At-least-once**: a message may arrive more than once; consumers must be idempotent.
//! - **Per-publisher order only**: nothing is promised across partition keys.
//! - **No persistence**: the outbox and ledger are the source of truth, not the bus.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// A subscription to a message stream.
///
/// Each subscription receives its own copy of every message published after it
/// was created (broadcast semantics). Intended for a single consuming thread.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(envelope) => subscription.settle(handle(envelope).is_ok()),
///         Err(RecvTimeoutError::Timeout) => continue,   // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break, // bus dropped
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
    settled: Option<Sender<bool>>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self {
            receiver,
            settled: None,
        }
    }

    /// Subscription whose transport waits for [`Subscription::settle`] after each
    /// message before acknowledging it upstream.
    pub fn with_settlement(receiver: Receiver<M>, settled: Sender<bool>) -> Self {
        Self {
            receiver,
            settled: Some(settled),
        }
    }

    /// Report the outcome of the message last received.
    ///
    /// `false` leaves it unacknowledged so the transport can redeliver it. A no-op for
    /// transports without acknowledgements.
    pub fn settle(&self, handled: bool) {
        if let Some(settled) = &self.settled {
            let _ = settled.send(handled);
        }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Transport-agnostic pub/sub bus.
///
/// ```text
/// Applier → outbox (same unit of work) → relay → EventBus::publish → subscribers
///                                                                    ├─ summary projection
///                                                                    └─ listeners
/// ```
///
/// `publish()` may fail (closed transport, network error). Callers that publish from
/// durable state (the outbox relay) retry later; nothing on the write path waits for it.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn settlements_reach_the_transport() {
        let (tx, rx) = mpsc::channel();
        let (settle_tx, settle_rx) = mpsc::channel();
        let sub = Subscription::with_settlement(rx, settle_tx);

        tx.send(1u32).unwrap();
        assert_eq!(sub.recv().unwrap(), 1);
        sub.settle(false);
        assert_eq!(settle_rx.try_recv(), Ok(false));

        let (_tx, rx) = mpsc::channel::<u32>();
        Subscription::new(rx).settle(true);
    }
}
