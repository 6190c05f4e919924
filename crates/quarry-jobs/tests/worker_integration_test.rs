//! Integration tests for WorkerPool and Scheduler against a real queue.
//!
//! This test suite validates:
//! - Worker-001: Pool processes enqueued jobs to completion
//! - Worker-002: Handler errors are requeued until the retry budget runs out
//! - Worker-003: The in-flight count never exceeds the concurrency bound
//! - Worker-004: The health gate suspends claiming while unhealthy
//! - Worker-005: stop() drains in-flight jobs before returning
//! - Worker-006: Event broadcasting works correctly
//! - Worker-007: start()/stop() are idempotent
//! - Sched-001: The scheduler's retention sweep deletes old completed jobs
//!
//! Each test runs against its own in-memory SQLite database, so tests are
//! fully isolated and can run in parallel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::sleep;

use quarry_core::{Job, JobQueue, JobStatus};
use quarry_db::{QueueConfig, SqliteJobQueue};
use quarry_jobs::{
    JobHandler, Scheduler, SchedulerConfig, WorkerConfig, WorkerEvent, WorkerPool,
    WorkerPoolBuilder,
};

/// Create an isolated in-memory queue.
async fn memory_queue(max_retries: i32) -> Arc<SqliteJobQueue> {
    init_tracing();
    let config = QueueConfig::default()
        .with_db_path(":memory:")
        .with_max_retries(max_retries);
    Arc::new(SqliteJobQueue::open(config).await.expect("open queue"))
}

/// Opt-in log output for debugging: `RUST_LOG=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Fast polling config so tests finish quickly.
fn fast_config(concurrency: usize) -> WorkerConfig {
    WorkerConfig::default()
        .with_concurrency(concurrency)
        .with_poll_interval(10)
        .with_health_interval(10)
}

/// Wait for a job to reach a specific status.
async fn wait_for_job_status(
    queue: &SqliteJobQueue,
    job_id: i64,
    expected: JobStatus,
    timeout: Duration,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if let Ok(Some(job)) = queue.get(job_id).await {
            if job.status == expected {
                return true;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Handler that records executed job ids and optionally fails.
struct TrackingHandler {
    executions: Arc<Mutex<Vec<i64>>>,
    should_fail: bool,
}

impl TrackingHandler {
    fn new(should_fail: bool) -> (Self, Arc<Mutex<Vec<i64>>>) {
        let executions = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                executions: executions.clone(),
                should_fail,
            },
            executions,
        )
    }
}

#[async_trait]
impl JobHandler for TrackingHandler {
    async fn execute(&self, job: Job) -> anyhow::Result<()> {
        self.executions.lock().await.push(job.id);
        if self.should_fail {
            anyhow::bail!("handler rejected job {}", job.id);
        }
        Ok(())
    }
}

/// Handler that sleeps and records the peak number of concurrent executions.
struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    hold: Duration,
}

#[async_trait]
impl JobHandler for ConcurrencyProbe {
    async fn execute(&self, _job: Job) -> anyhow::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// WORKER
// ============================================================================

#[tokio::test]
async fn test_worker_processes_job_to_completion() {
    let queue = memory_queue(4).await;
    let (handler, executions) = TrackingHandler::new(false);

    let job = queue
        .enqueue("process_batch", json!({"batch": 1}))
        .await
        .expect("enqueue");

    let pool = WorkerPool::new(queue.clone(), Arc::new(handler), fast_config(1));
    pool.start();

    assert!(
        wait_for_job_status(&queue, job.id, JobStatus::Completed, Duration::from_secs(5)).await,
        "job did not complete"
    );
    pool.stop().await;

    assert_eq!(executions.lock().await.as_slice(), &[job.id]);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.total, 1);
}

#[tokio::test]
async fn test_worker_processes_jobs_in_creation_order() {
    let queue = memory_queue(4).await;
    let (handler, executions) = TrackingHandler::new(false);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(queue.enqueue("step", json!(i)).await.unwrap().id);
    }

    let pool = WorkerPool::new(queue.clone(), Arc::new(handler), fast_config(1));
    pool.start();

    assert!(
        wait_for_job_status(
            &queue,
            *ids.last().unwrap(),
            JobStatus::Completed,
            Duration::from_secs(5)
        )
        .await
    );
    pool.stop().await;

    // With a single poller, execution order is claim order is FIFO.
    assert_eq!(executions.lock().await.as_slice(), ids.as_slice());
}

#[tokio::test]
async fn test_failing_handler_exhausts_retry_budget() {
    // Scenario D: concurrency 1, handler always errors, maxRetries 2.
    // The job is requeued twice and lands in failed on the third attempt.
    let queue = memory_queue(2).await;
    let (handler, executions) = TrackingHandler::new(true);

    let job = queue.enqueue("doomed", json!(null)).await.unwrap();

    let pool = WorkerPool::new(queue.clone(), Arc::new(handler), fast_config(1));
    pool.start();

    assert!(
        wait_for_job_status(&queue, job.id, JobStatus::Failed, Duration::from_secs(5)).await,
        "job never reached failed"
    );
    pool.stop().await;

    let stored = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 3);
    assert!(stored
        .error
        .as_deref()
        .expect("error recorded")
        .contains("handler rejected job"));

    assert_eq!(executions.lock().await.len(), 3);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_in_flight_never_exceeds_concurrency() {
    let queue = memory_queue(4).await;
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = ConcurrencyProbe {
        current: current.clone(),
        peak: peak.clone(),
        hold: Duration::from_millis(50),
    };

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(queue.enqueue("probe", json!(i)).await.unwrap().id);
    }

    let pool = WorkerPool::new(queue.clone(), Arc::new(handler), fast_config(2));
    pool.start();

    for id in &ids {
        assert!(
            wait_for_job_status(&queue, *id, JobStatus::Completed, Duration::from_secs(10)).await
        );
    }
    pool.stop().await;

    assert!(peak.load(Ordering::SeqCst) <= 2, "concurrency bound broken");
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(current.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrency_bound_holds_under_contention() {
    // Pollers race each other for slots on a real multi-thread runtime;
    // a deep backlog of slow jobs keeps every claim window contended.
    let queue = memory_queue(4).await;
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = ConcurrencyProbe {
        current: current.clone(),
        peak: peak.clone(),
        hold: Duration::from_millis(30),
    };

    let mut ids = Vec::new();
    for i in 0..30 {
        ids.push(queue.enqueue("contended", json!(i)).await.unwrap().id);
    }

    let pool = WorkerPool::new(queue.clone(), Arc::new(handler), fast_config(2));
    pool.start();

    for id in &ids {
        assert!(
            wait_for_job_status(&queue, *id, JobStatus::Completed, Duration::from_secs(30)).await
        );
    }
    pool.stop().await;

    let peak = peak.load(Ordering::SeqCst);
    assert!(
        peak <= 2,
        "peak concurrent handlers = {peak} exceeds concurrency bound 2"
    );
    assert_eq!(current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_panicking_handler_is_recorded_as_failure() {
    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn execute(&self, _job: Job) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    let queue = memory_queue(0).await;
    let job = queue.enqueue("explosive", json!(null)).await.unwrap();

    let pool = WorkerPool::new(queue.clone(), Arc::new(PanickingHandler), fast_config(1));
    pool.start();

    assert!(
        wait_for_job_status(&queue, job.id, JobStatus::Failed, Duration::from_secs(5)).await,
        "panicked job not marked failed"
    );
    pool.stop().await;

    let stored = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.error.as_deref(), Some("job handler panicked"));
}

// ============================================================================
// HEALTH GATE
// ============================================================================

#[tokio::test]
async fn test_unhealthy_pool_claims_nothing_until_recovery() {
    let queue = memory_queue(4).await;
    let (handler, _executions) = TrackingHandler::new(false);
    let healthy = Arc::new(AtomicBool::new(false));

    let flag = healthy.clone();
    let pool = WorkerPoolBuilder::new(queue.clone(), Arc::new(handler))
        .with_config(fast_config(1))
        .with_health_check(move || {
            let flag = flag.clone();
            async move { Ok(flag.load(Ordering::SeqCst)) }
        })
        .build();
    pool.start();

    // Let the health loop observe the unhealthy predicate first.
    sleep(Duration::from_millis(50)).await;
    assert!(!pool.is_healthy());

    let job = queue.enqueue("gated", json!(null)).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    let stored = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending, "claimed while unhealthy");

    // Recovery: the next health tick reopens the gate.
    healthy.store(true, Ordering::SeqCst);
    assert!(
        wait_for_job_status(&queue, job.id, JobStatus::Completed, Duration::from_secs(10)).await,
        "job not processed after recovery"
    );
    assert!(pool.is_healthy());
    pool.stop().await;
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_stop_drains_in_flight_job() {
    let queue = memory_queue(4).await;
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = ConcurrencyProbe {
        current: current.clone(),
        peak,
        hold: Duration::from_millis(200),
    };

    let job = queue.enqueue("slow", json!(null)).await.unwrap();

    let pool = WorkerPool::new(queue.clone(), Arc::new(handler), fast_config(1));
    pool.start();

    // Wait until the handler is actually executing, then stop.
    let start = std::time::Instant::now();
    while current.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(current.load(Ordering::SeqCst), 1);

    pool.stop().await;

    // stop() returned only after the in-flight handler finished.
    assert_eq!(pool.in_flight(), 0);
    let stored = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let queue = memory_queue(4).await;
    let (handler, executions) = TrackingHandler::new(false);

    let job = queue.enqueue("once", json!(null)).await.unwrap();

    let pool = WorkerPool::new(queue.clone(), Arc::new(handler), fast_config(1));
    pool.start();
    pool.start();
    assert!(pool.is_running());

    assert!(
        wait_for_job_status(&queue, job.id, JobStatus::Completed, Duration::from_secs(5)).await
    );

    pool.stop().await;
    pool.stop().await;
    assert!(!pool.is_running());

    // Double start never produced duplicate executions.
    assert_eq!(executions.lock().await.len(), 1);
}

#[tokio::test]
async fn test_stopped_pool_leaves_new_jobs_pending() {
    let queue = memory_queue(4).await;
    let (handler, _executions) = TrackingHandler::new(false);

    let pool = WorkerPool::new(queue.clone(), Arc::new(handler), fast_config(1));
    pool.start();
    pool.stop().await;

    let job = queue.enqueue("later", json!(null)).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let stored = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
}

// ============================================================================
// EVENTS
// ============================================================================

#[tokio::test]
async fn test_events_for_success_and_failure() {
    let queue = memory_queue(0).await;

    struct SelectiveHandler;

    #[async_trait]
    impl JobHandler for SelectiveHandler {
        async fn execute(&self, job: Job) -> anyhow::Result<()> {
            if job.name == "bad" {
                anyhow::bail!("no");
            }
            Ok(())
        }
    }

    let good = queue.enqueue("good", json!(null)).await.unwrap();
    let bad = queue.enqueue("bad", json!(null)).await.unwrap();

    let pool = WorkerPool::new(queue.clone(), Arc::new(SelectiveHandler), fast_config(1));
    let mut events = pool.events();
    pool.start();

    assert!(
        wait_for_job_status(&queue, good.id, JobStatus::Completed, Duration::from_secs(5)).await
    );
    assert!(wait_for_job_status(&queue, bad.id, JobStatus::Failed, Duration::from_secs(5)).await);
    pool.stop().await;

    let mut started = Vec::new();
    let mut completed = Vec::new();
    let mut failed = Vec::new();
    let mut saw_worker_started = false;
    let mut saw_worker_stopped = false;

    while let Ok(event) = events.try_recv() {
        match event {
            WorkerEvent::WorkerStarted => saw_worker_started = true,
            WorkerEvent::WorkerStopped => saw_worker_stopped = true,
            WorkerEvent::JobStarted { job_id, .. } => started.push(job_id),
            WorkerEvent::JobCompleted { job_id, .. } => completed.push(job_id),
            WorkerEvent::JobFailed { job_id, error, .. } => failed.push((job_id, error)),
        }
    }

    assert!(saw_worker_started);
    assert!(saw_worker_stopped);
    assert!(started.contains(&good.id));
    assert!(started.contains(&bad.id));
    assert_eq!(completed, vec![good.id]);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, bad.id);
    assert!(failed[0].1.contains("no"));
}

// ============================================================================
// SCHEDULER
// ============================================================================

#[tokio::test]
async fn test_scheduler_sweeps_old_completed_jobs() {
    let queue = memory_queue(4).await;

    let old = queue.enqueue("old", json!(null)).await.unwrap();
    let fresh = queue.enqueue("fresh", json!(null)).await.unwrap();
    queue.claim().await.unwrap();
    queue.complete(old.id).await.unwrap();
    queue.claim().await.unwrap();
    queue.complete(fresh.id).await.unwrap();

    // Backdate one completed job past the retention window.
    let stale = (Utc::now() - chrono::Duration::hours(48)).to_rfc3339_opts(SecondsFormat::Micros, true);
    sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE id = ?2")
        .bind(&stale)
        .bind(old.id)
        .execute(queue.pool())
        .await
        .unwrap();

    let scheduler = Scheduler::new(
        queue.clone(),
        SchedulerConfig::default()
            .with_cleanup_interval(20)
            .with_cleanup_older_than(24),
    );
    scheduler.start();

    let start = std::time::Instant::now();
    while queue.get(old.id).await.unwrap().is_some() && start.elapsed() < Duration::from_secs(5) {
        sleep(Duration::from_millis(10)).await;
    }
    scheduler.stop().await;

    assert!(queue.get(old.id).await.unwrap().is_none(), "old job swept");
    assert!(queue.get(fresh.id).await.unwrap().is_some(), "fresh kept");
}

#[tokio::test]
async fn test_worker_and_scheduler_share_one_queue() {
    // End-to-end: enqueue, process, backdate, sweep.
    let queue = memory_queue(4).await;
    let (handler, _executions) = TrackingHandler::new(false);

    let job = queue.enqueue("lifecycle", json!({"n": 1})).await.unwrap();

    let pool = WorkerPool::new(queue.clone(), Arc::new(handler), fast_config(1));
    pool.start();
    assert!(
        wait_for_job_status(&queue, job.id, JobStatus::Completed, Duration::from_secs(5)).await
    );
    pool.stop().await;

    let stale = (Utc::now() - chrono::Duration::hours(48)).to_rfc3339_opts(SecondsFormat::Micros, true);
    sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE id = ?2")
        .bind(&stale)
        .bind(job.id)
        .execute(queue.pool())
        .await
        .unwrap();

    let scheduler = Scheduler::new(
        queue.clone(),
        SchedulerConfig::default().with_cleanup_interval(20),
    );
    scheduler.start();

    let start = std::time::Instant::now();
    while queue.get(job.id).await.unwrap().is_some() && start.elapsed() < Duration::from_secs(5) {
        sleep(Duration::from_millis(10)).await;
    }
    scheduler.stop().await;

    assert_eq!(queue.stats().await.unwrap().total, 0);
}
