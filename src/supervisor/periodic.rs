//! Cancellable fixed-interval background task.
//!
//! Each tick runs in its own spawned task, so a panicking tick is logged and
//! the next tick still fires. Ticks never overlap: the next one is not
//! scheduled until the current one finishes.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Handle to a running periodic task. Dropping it aborts the loop.
pub struct PeriodicTask {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Start calling `tick` every `period`. The first tick fires one period
    /// from now.
    pub fn start<F, Fut>(name: &'static str, period: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {}
                }

                let run = tokio::spawn(tick());
                tokio::select! {
                    // A tick caught by stop is left to finish on its own.
                    _ = stop_rx.changed() => break,
                    outcome = run => {
                        if let Err(e) = outcome {
                            if e.is_panic() {
                                tracing::error!(task = name, "periodic tick panicked");
                            }
                        }
                    }
                }
            }

            tracing::debug!(task = name, "periodic task stopped");
        });

        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "periodic task started");

        Self {
            name,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
