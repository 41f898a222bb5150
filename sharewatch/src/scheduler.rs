// sharewatch/src/scheduler.rs
//
// Fixed-interval background tasks with skip-if-busy semantics.
//
// Each PeriodicTask awaits its job inline, so while a run is in flight the
// interval keeps ticking but missed ticks are dropped (MissedTickBehavior::Skip)
// instead of queuing up behind it. At most one run per task is ever active.
//
// Stopping goes through Shutdown, a one-shot watch flag. The loop selects on
// it between runs; an in-flight run is never cancelled.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

// ── Stop flag ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> { self.tx.subscribe() }

    /// Flip the flag. Returns false if it was already set.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped { return false; }
            *stopped = true;
            true
        })
    }

    #[cfg(test)]
    pub fn is_triggered(&self) -> bool { *self.tx.borrow() }
}

impl Default for Shutdown { fn default() -> Self { Self::new() } }

/// Resolves once the flag is set (or its sender is gone).
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() { return; }
    }
}

// ── Periodic task ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PeriodicTask {
    name:            &'static str,
    period:          Duration,
    initial_delay:   Duration,
    run_immediately: bool,
}

impl PeriodicTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self { name, period, initial_delay: Duration::ZERO, run_immediately: false }
    }

    /// Wait this long before the first run.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Run once as soon as the task starts (after any initial delay).
    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }

    pub fn spawn<F, Fut>(self, mut stop: watch::Receiver<bool>, mut job: F) -> JoinHandle<()>
    where
        F:   FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let Self { name, period, initial_delay, run_immediately } = self;

            if !initial_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(initial_delay) => {}
                    _ = stopped(&mut stop) => {
                        debug!(task = name, "stopped before first run");
                        return;
                    }
                }
            }

            let first = if run_immediately { Instant::now() } else { Instant::now() + period };
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(task = name, period_secs = period.as_secs(), "periodic task started");

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break,
                    _ = ticker.tick() => job().await,
                }
            }
            info!(task = name, "periodic task stopped");
        })
    }
}
