use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Schedule for a periodic background job (alert scans, outbox draining).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicRunner {
    #[serde(with = "crate::retry::millis")]
    pub interval: Duration,
    /// Consecutive failures retried with backoff before waiting for the next tick.
    pub max_retries: u32,
    #[serde(with = "crate::retry::millis")]
    pub base_backoff: Duration,
}

impl Default for PeriodicRunner {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
        }
    }
}

/// Handle for a running periodic job (shutdown + trigger hook).
#[derive(Debug)]
pub struct PeriodicHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl PeriodicHandle {
    /// Ask for a run before the next tick.
    ///
    /// Triggers are coalesced: if a run is already pending this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl PeriodicRunner {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Spawn a thread running `job` every `interval`, on trigger, and once at startup.
    ///
    /// Failures are logged and retried with bounded exponential backoff; they never
    /// propagate out of the thread.
    pub fn spawn<F, E>(&self, name: &'static str, job: F) -> io::Result<PeriodicHandle>
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: core::fmt::Display,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

        let cfg = self.clone();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runner_loop(name, cfg, shutdown_rx, trigger_rx, job))?;

        Ok(PeriodicHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
        })
    }
}

fn runner_loop<F, E>(
    name: &'static str,
    cfg: PeriodicRunner,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    mut job: F,
) where
    F: FnMut() -> Result<(), E>,
    E: core::fmt::Display,
{
    info!(runner = name, interval_ms = cfg.interval.as_millis() as u64, "periodic runner started");

    let mut next_tick = Instant::now() + cfg.interval;
    let mut pending = true; // run once on startup
    let mut failures: u32 = 0;
    let mut backoff_until: Option<Instant> = None;

    loop {
        // Shutdown has priority.
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            // Keep a stable cadence even if we were delayed.
            while next_tick <= now {
                next_tick += cfg.interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if let Some(until) = backoff_until {
            if Instant::now() < until {
                thread::sleep(Duration::from_millis(50).min(cfg.interval));
                continue;
            }
            backoff_until = None;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(250));
            thread::sleep(sleep_for);
            continue;
        }

        pending = false;

        match job() {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(runner = name, failures, error = %e, "periodic job failed");
                if failures <= cfg.max_retries {
                    pending = true;
                    backoff_until = Some(Instant::now() + backoff(cfg.base_backoff, failures));
                } else {
                    failures = 0;
                }
            }
        }
    }

    info!(runner = name, "periodic runner stopped");
}

pub(crate) fn backoff(base: Duration, attempt: u32) -> Duration {
    // base * 2^(attempt-1), capped at 10s.
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(pow as u128);
    Duration::from_millis(ms.min(10_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn wait_for(counter: &AtomicU32, at_least: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if counter.load(Ordering::SeqCst) >= at_least {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 3), Duration::from_millis(400));
        assert_eq!(backoff(base, 30), Duration::from_secs(10));
    }

    #[test]
    fn runs_on_startup_and_on_trigger() {
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let handle = PeriodicRunner::every(Duration::from_secs(3600)).spawn("test-runner", move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        })
        .unwrap();

        assert!(wait_for(&runs, 1));
        handle.trigger();
        assert!(wait_for(&runs, 2));
        handle.shutdown();
    }

    #[test]
    fn failures_are_retried_with_backoff() {
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let cfg = PeriodicRunner {
            interval: Duration::from_secs(3600),
            max_retries: 3,
            base_backoff: Duration::from_millis(5),
        };
        let handle = cfg.spawn("failing-runner", move || {
            let n = r.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err("transient".to_string()) } else { Ok(()) }
        })
        .unwrap();

        assert!(wait_for(&runs, 3));
        handle.shutdown();
    }
}
