//! Periodic maintenance scheduler for the persistent queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use quarry_core::{defaults, JobQueue};

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between retention sweeps, in milliseconds.
    pub cleanup_interval_ms: u64,
    /// Retention window: completed jobs older than this many hours are deleted.
    pub cleanup_older_than_hours: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: defaults::CLEANUP_INTERVAL_MS,
            cleanup_older_than_hours: defaults::CLEANUP_OLDER_THAN_HOURS,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SCHEDULER_CLEANUP_INTERVAL_MS` | `3600000` | Interval between sweeps |
    /// | `SCHEDULER_CLEANUP_OLDER_THAN_HOURS` | `24` | Retention window |
    pub fn from_env() -> Self {
        let cleanup_interval_ms = std::env::var("SCHEDULER_CLEANUP_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::CLEANUP_INTERVAL_MS);

        let cleanup_older_than_hours = std::env::var("SCHEDULER_CLEANUP_OLDER_THAN_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults::CLEANUP_OLDER_THAN_HOURS);

        Self {
            cleanup_interval_ms,
            cleanup_older_than_hours,
        }
    }

    /// Set the sweep interval.
    pub fn with_cleanup_interval(mut self, ms: u64) -> Self {
        self.cleanup_interval_ms = ms;
        self
    }

    /// Set the retention window.
    pub fn with_cleanup_older_than(mut self, hours: i64) -> Self {
        self.cleanup_older_than_hours = hours;
        self
    }
}

/// Timer-driven housekeeper sweeping old completed jobs from the queue.
///
/// A failed sweep is logged and retried on the next tick; it never stops
/// the scheduler.
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler over the given queue.
    pub fn new(queue: Arc<dyn JobQueue>, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            config,
            running: AtomicBool::new(false),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Whether the sweep timer is armed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Arm the repeating sweep timer. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Scheduler already running, start() is a no-op");
            return;
        }
        let _ = self.shutdown_tx.send(false);

        info!(
            cleanup_interval_ms = self.config.cleanup_interval_ms,
            cleanup_older_than_hours = self.config.cleanup_older_than_hours,
            "Scheduler started"
        );

        let queue = self.queue.clone();
        let older_than_hours = self.config.cleanup_older_than_hours;
        let period = Duration::from_millis(self.config.cleanup_interval_ms.max(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick fires immediately; consume it so the
            // initial sweep happens one full period after start.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.cleanup_completed(older_than_hours).await {
                            Ok(0) => {}
                            Ok(deleted) => {
                                info!(deleted, older_than_hours, "Retention sweep removed completed jobs");
                            }
                            Err(e) => {
                                error!(error = %e, "Retention sweep failed; retrying on next tick");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *self.handle.lock().expect("handle lock poisoned") = Some(handle);
    }

    /// Cancel the sweep timer. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Scheduler already stopped, stop() is a no-op");
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self.handle.lock().expect("handle lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = ?e, "Scheduler task panicked");
            }
        }
        info!("Scheduler stopped");
    }
}
