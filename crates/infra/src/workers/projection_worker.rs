use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use stockledger_events::{EventBus, Subscription};

use crate::retry::RetryPolicy;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Generic bus consumer loop.
///
/// - Subscribes to an event bus
/// - Applies an idempotent handler for each message, retrying failures with backoff
/// - Settles each message so acknowledging transports only ack handled ones
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ProjectionWorker;

enum Outcome {
    Handled,
    GaveUp,
    Shutdown,
}

impl ProjectionWorker {
    /// Spawn a worker thread that processes messages from a new bus subscription.
    ///
    /// `handler` must be idempotent (at-least-once delivery). A failed message is
    /// retried under `retry`; once the attempts are exhausted it is settled as
    /// unhandled and left to the transport's redelivery.
    pub fn spawn<M, B, H, E>(
        name: &'static str,
        bus: B,
        retry: RetryPolicy,
        mut handler: H,
    ) -> io::Result<WorkerHandle>
    where
        M: Send + 'static,
        B: EventBus<M>,
        H: FnMut(&M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, &retry, &mut handler))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<M, H, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    retry: &RetryPolicy,
    handler: &mut H,
) where
    H: FnMut(&M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => match handle_with_retry(name, &msg, retry, handler, &shutdown_rx) {
                Outcome::Handled => sub.settle(true),
                Outcome::GaveUp => sub.settle(false),
                Outcome::Shutdown => {
                    sub.settle(false);
                    break;
                }
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn handle_with_retry<M, H, E>(
    name: &'static str,
    msg: &M,
    retry: &RetryPolicy,
    handler: &mut H,
    shutdown_rx: &mpsc::Receiver<()>,
) -> Outcome
where
    H: FnMut(&M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let err = match handler(msg) {
            Ok(()) => return Outcome::Handled,
            Err(err) => err,
        };

        if !retry.should_retry(attempts) {
            error!(worker = name, attempts, error = ?err, "handler failed; message left unacknowledged");
            return Outcome::GaveUp;
        }

        let delay = retry.delay_for_attempt(attempts);
        warn!(worker = name, attempts, delay_ms = delay.as_millis() as u64, error = ?err, "handler failed; retrying");
        match shutdown_rx.recv_timeout(delay) {
            Ok(()) => return Outcome::Shutdown,
            Err(RecvTimeoutError::Timeout) => {}
            // Handle dropped without a shutdown request: keep the backoff.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use stockledger_events::InMemoryEventBus;

    /// Single-subscriber bus that records how each message was settled.
    #[derive(Debug, Default)]
    struct AckingBus {
        outbound: Mutex<Option<mpsc::Sender<u32>>>,
        settlements: Mutex<Option<mpsc::Receiver<bool>>>,
    }

    impl AckingBus {
        fn next_settlement(&self) -> Option<bool> {
            let guard = self.settlements.lock().unwrap();
            guard.as_ref()?.recv_timeout(Duration::from_secs(5)).ok()
        }
    }

    impl EventBus<u32> for AckingBus {
        type Error = String;

        fn publish(&self, message: u32) -> Result<(), String> {
            let guard = self.outbound.lock().map_err(|e| e.to_string())?;
            guard
                .as_ref()
                .ok_or("no subscriber")?
                .send(message)
                .map_err(|e| e.to_string())
        }

        fn subscribe(&self) -> Subscription<u32> {
            let (tx, rx) = mpsc::channel();
            let (settle_tx, settle_rx) = mpsc::channel();
            *self.outbound.lock().unwrap() = Some(tx);
            *self.settlements.lock().unwrap() = Some(settle_rx);
            Subscription::with_settlement(rx, settle_tx)
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn delivers_until_shutdown() {
        let bus = Arc::new(InMemoryEventBus::<u32>::new());
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        let handle = ProjectionWorker::spawn("test-worker", bus.clone(), fast_retry(2), move |n: &u32| {
            if *n == 0 {
                return Err("zero");
            }
            s.fetch_add(*n, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        bus.publish(0).unwrap();
        bus.publish(2).unwrap();
        bus.publish(3).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        handle.shutdown();
    }

    #[test]
    fn failed_message_is_retried_then_acknowledged() {
        let bus = Arc::new(AckingBus::default());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let handle = ProjectionWorker::spawn("retrying-worker", bus.clone(), fast_retry(5), move |_: &u32| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err("version conflict");
            }
            Ok(())
        })
        .unwrap();

        bus.publish(7).unwrap();
        assert_eq!(bus.next_settlement(), Some(true));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        handle.shutdown();
    }

    #[test]
    fn exhausted_retries_leave_message_unacknowledged() {
        let bus = Arc::new(AckingBus::default());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let handle = ProjectionWorker::spawn("failing-worker", bus.clone(), fast_retry(3), move |_: &u32| {
            c.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("store unavailable")
        })
        .unwrap();

        bus.publish(1).unwrap();
        assert_eq!(bus.next_settlement(), Some(false));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        handle.shutdown();
    }
}
