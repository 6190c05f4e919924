//! Centralized default constants for the quarry job queue.
//!
//! **This module is the single source of truth** for all shared default
//! values. All crates should reference these constants instead of defining
//! their own magic numbers.

// =============================================================================
// STORE
// =============================================================================

/// Default SQLite database path.
pub const DB_PATH: &str = "./queue.db";

/// Default job table name. Configurable, but always validated as an
/// identifier before use in query text.
pub const TABLE_NAME: &str = "jobs";

/// Default maximum retry count for failed jobs.
pub const JOB_MAX_RETRIES: i32 = 4;

/// Default page size for dead-letter listings.
pub const FAILED_JOBS_LIMIT: i64 = 100;

// =============================================================================
// WORKER
// =============================================================================

/// Default maximum concurrent in-flight jobs per pool.
pub const WORKER_CONCURRENCY: usize = 1;

/// Default polling interval when the queue is empty (milliseconds).
pub const WORKER_POLL_INTERVAL_MS: u64 = 1000;

/// Sleep between admission checks when the pool is at capacity (milliseconds).
pub const WORKER_BACKPRESSURE_MS: u64 = 100;

/// Sleep before re-checking an unhealthy pool (milliseconds).
pub const WORKER_UNHEALTHY_RETRY_MS: u64 = 5000;

/// Interval between health predicate invocations (milliseconds).
pub const WORKER_HEALTH_INTERVAL_MS: u64 = 30_000;

/// How often the shutdown drain re-checks the in-flight counter (milliseconds).
pub const WORKER_DRAIN_POLL_MS: u64 = 100;

/// Ceiling on the shutdown drain wait (milliseconds). In-flight handlers
/// past this point keep running; stop() returns with a warning.
pub const WORKER_DRAIN_TIMEOUT_MS: u64 = 30_000;

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// SCHEDULER
// =============================================================================

/// Default interval between retention sweeps (milliseconds, 1 hour).
pub const CLEANUP_INTERVAL_MS: u64 = 3_600_000;

/// Default retention window for completed jobs (hours).
pub const CLEANUP_OLDER_THAN_HOURS: i64 = 24;
