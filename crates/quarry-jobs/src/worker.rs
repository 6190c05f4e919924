//! Concurrency-bounded worker pool polling the persistent queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use quarry_core::{defaults, Job, JobQueue};

use crate::handler::JobHandler;

/// Async health predicate invoked by the pool's health loop.
pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum simultaneous in-flight jobs (pool-wide).
    pub concurrency: usize,
    /// Polling interval when the queue is empty, in milliseconds.
    pub poll_interval_ms: u64,
    /// Interval between health predicate invocations, in milliseconds.
    pub health_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::WORKER_CONCURRENCY,
            poll_interval_ms: defaults::WORKER_POLL_INTERVAL_MS,
            health_interval_ms: defaults::WORKER_HEALTH_INTERVAL_MS,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_CONCURRENCY` | `1` | Max concurrent in-flight jobs |
    /// | `WORKER_POLL_INTERVAL_MS` | `1000` | Polling interval when queue is empty |
    pub fn from_env() -> Self {
        let concurrency = std::env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::WORKER_CONCURRENCY)
            .max(1);

        let poll_interval_ms = std::env::var("WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::WORKER_POLL_INTERVAL_MS);

        Self {
            concurrency,
            poll_interval_ms,
            health_interval_ms: defaults::WORKER_HEALTH_INTERVAL_MS,
        }
    }

    /// Set the concurrency bound.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Set the empty-queue polling interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the health check interval.
    pub fn with_health_interval(mut self, ms: u64) -> Self {
        self.health_interval_ms = ms;
        self
    }
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The pool started its pollers.
    WorkerStarted,
    /// The pool stopped (after the shutdown drain).
    WorkerStopped,
    /// A job was claimed and handed to the handler.
    JobStarted { job_id: i64, job_name: String },
    /// A job completed successfully.
    JobCompleted { job_id: i64, job_name: String },
    /// A job's handler failed (the queue decides pending vs failed).
    JobFailed {
        job_id: i64,
        job_name: String,
        error: String,
    },
}

/// Shared state for pollers, the health loop, and spawned job tasks.
struct PoolInner {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    health_check: HealthCheck,
    /// Gate for new claims; flipped by start()/stop().
    running: AtomicBool,
    /// Advisory health flag maintained by the health loop.
    healthy: AtomicBool,
    /// Reserved execution slots: taken by a poller before it claims,
    /// released when the handler finishes (or the claim comes up empty).
    in_flight: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<WorkerEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Fixed-size pool of pollers racing to claim jobs from one queue.
///
/// Each claimed job runs in its own spawned task; the pollers keep polling
/// (gated by the pool-wide in-flight counter) while handlers execute.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// Builder for assembling a worker pool with an optional health predicate.
pub struct WorkerPoolBuilder {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    health_check: HealthCheck,
}

impl WorkerPoolBuilder {
    /// Create a new builder over a queue and handler.
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue,
            handler,
            config: WorkerConfig::default(),
            health_check: Arc::new(|| async { anyhow::Ok(true) }.boxed()),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the health predicate (default: always healthy).
    pub fn with_health_check<F, Fut>(mut self, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.health_check = Arc::new(move || check().boxed());
        self
    }

    /// Build the pool.
    pub fn build(self) -> WorkerPool {
        let (shutdown_tx, _) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);

        WorkerPool {
            inner: Arc::new(PoolInner {
                queue: self.queue,
                handler: self.handler,
                config: self.config,
                health_check: self.health_check,
                running: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                shutdown_tx,
                event_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl WorkerPool {
    /// Create a pool with the default always-healthy predicate.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Self {
        WorkerPoolBuilder::new(queue, handler)
            .with_config(config)
            .build()
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Current advisory health state.
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }

    /// Whether the pool is accepting new claims.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the pollers and the health loop. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("Worker pool already running, start() is a no-op");
            return;
        }
        self.inner.healthy.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(false);

        info!(
            concurrency = self.inner.config.concurrency,
            poll_interval_ms = self.inner.config.poll_interval_ms,
            "Worker pool started"
        );
        let _ = self.inner.event_tx.send(WorkerEvent::WorkerStarted);

        let mut handles = Vec::new();
        for poller_id in 0..self.inner.config.concurrency.max(1) {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move {
                poll_loop(inner, poller_id).await;
            }));
        }
        let inner = self.inner.clone();
        handles.push(tokio::spawn(async move {
            health_loop(inner).await;
        }));

        self.inner
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .extend(handles);
    }

    /// Stop claiming new work and drain in-flight jobs.
    ///
    /// Waits up to 30s for the in-flight counter to reach zero, then
    /// returns anyway (in-flight handlers are never killed). Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            debug!("Worker pool already stopped, stop() is a no-op");
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);

        let start = Instant::now();
        let drain_timeout = Duration::from_millis(defaults::WORKER_DRAIN_TIMEOUT_MS);
        loop {
            let in_flight = self.inner.in_flight.load(Ordering::SeqCst);
            if in_flight == 0 {
                break;
            }
            if start.elapsed() >= drain_timeout {
                warn!(
                    in_flight,
                    timeout_ms = defaults::WORKER_DRAIN_TIMEOUT_MS,
                    "Shutdown drain timed out; in-flight handlers left running"
                );
                break;
            }
            sleep(Duration::from_millis(defaults::WORKER_DRAIN_POLL_MS)).await;
        }

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = ?e, "Worker task panicked");
            }
        }

        let _ = self.inner.event_tx.send(WorkerEvent::WorkerStopped);
        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            "Worker pool stopped"
        );
    }
}

/// Sleep that wakes early on shutdown. Returns false when shutting down.
async fn idle_wait(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = sleep(duration) => true,
        _ = shutdown_rx.changed() => false,
    }
}

/// One poller: claim, dispatch, repeat. Never blocks on handler completion.
async fn poll_loop(inner: Arc<PoolInner>, poller_id: usize) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let poll_interval = Duration::from_millis(inner.config.poll_interval_ms);
    let backpressure = Duration::from_millis(defaults::WORKER_BACKPRESSURE_MS);
    let unhealthy_retry = Duration::from_millis(defaults::WORKER_UNHEALTHY_RETRY_MS);

    debug!(poller_id, "Poller started");

    while inner.running.load(Ordering::SeqCst) {
        if !inner.healthy.load(Ordering::SeqCst) {
            if !idle_wait(&mut shutdown_rx, unhealthy_retry).await {
                break;
            }
            continue;
        }

        // Reserve the slot before claiming. A load-then-claim-then-add
        // sequence would let two pollers pass the capacity check during
        // each other's claim round-trip and overshoot the bound.
        let reserved = inner
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < inner.config.concurrency).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            if !idle_wait(&mut shutdown_rx, backpressure).await {
                break;
            }
            continue;
        }

        match inner.queue.claim().await {
            Ok(Some(job)) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    execute_job(inner, job).await;
                });
            }
            Ok(None) => {
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                if !idle_wait(&mut shutdown_rx, poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                error!(poller_id, error = %e, "Failed to claim job");
                if !idle_wait(&mut shutdown_rx, poll_interval).await {
                    break;
                }
            }
        }
    }

    debug!(poller_id, "Poller stopped");
}

/// Execute a single claimed job and report the outcome to the queue.
///
/// Handler errors and panics are converted into `fail()` calls; nothing
/// here ever propagates out of the spawned task.
async fn execute_job(inner: Arc<PoolInner>, job: Job) {
    let start = Instant::now();
    let job_id = job.id;
    let job_name = job.name.clone();

    info!(job_id, job_name = %job_name, "Processing job");
    let _ = inner.event_tx.send(WorkerEvent::JobStarted {
        job_id,
        job_name: job_name.clone(),
    });

    let outcome = std::panic::AssertUnwindSafe(inner.handler.execute(job))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            if let Err(e) = inner.queue.complete(job_id).await {
                error!(job_id, error = %e, "Failed to mark job as completed");
            } else {
                info!(
                    job_id,
                    job_name = %job_name,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );
                let _ = inner.event_tx.send(WorkerEvent::JobCompleted {
                    job_id,
                    job_name: job_name.clone(),
                });
            }
        }
        outcome => {
            let message = match outcome {
                Ok(Err(e)) => e.to_string(),
                _ => "job handler panicked".to_string(),
            };
            if let Err(e) = inner.queue.fail(job_id, &message, false).await {
                error!(job_id, error = %e, "Failed to mark job as failed");
            } else {
                warn!(
                    job_id,
                    job_name = %job_name,
                    error = %message,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job failed"
                );
                let _ = inner.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    job_name: job_name.clone(),
                    error: message,
                });
            }
        }
    }

    inner.in_flight.fetch_sub(1, Ordering::SeqCst);
}

/// Advisory health loop: re-runs the predicate on a fixed interval and
/// flips the pool's health flag. Never cancels in-flight work.
async fn health_loop(inner: Arc<PoolInner>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let interval = Duration::from_millis(inner.config.health_interval_ms);

    while inner.running.load(Ordering::SeqCst) {
        if !idle_wait(&mut shutdown_rx, interval).await {
            break;
        }

        let was_healthy = inner.healthy.load(Ordering::SeqCst);
        match (inner.health_check)().await {
            Ok(true) => {
                inner.healthy.store(true, Ordering::SeqCst);
                if !was_healthy {
                    info!("Worker pool health restored");
                }
            }
            Ok(false) => {
                inner.healthy.store(false, Ordering::SeqCst);
                warn!("Health check returned unhealthy; pausing claims");
            }
            Err(e) => {
                inner.healthy.store(false, Ordering::SeqCst);
                warn!(error = %e, "Health check failed; pausing claims");
            }
        }
    }
}
