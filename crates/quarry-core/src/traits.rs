//! The persistence seam between the durable store and the worker/scheduler.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::models::{Job, QueueStats};

/// Durable job store with atomic status transitions.
///
/// Implementations must guarantee that `claim` never hands the same
/// pending job to two concurrent callers, and that every transition is
/// atomic with respect to the underlying store.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a new pending job. Fails with `Error::InvalidInput` if the
    /// name is empty or the payload cannot be serialized.
    async fn enqueue(&self, name: &str, payload: JsonValue) -> Result<Job>;

    /// Atomically claim the oldest pending job, flipping it to processing.
    /// Returns `None` when no pending job exists.
    async fn claim(&self) -> Result<Option<Job>>;

    /// Mark a job completed. A missing id is logged, not an error.
    async fn complete(&self, job_id: i64) -> Result<()>;

    /// Record a failure. Requeues as pending while the retry budget lasts;
    /// moves to failed once exhausted, or immediately when `permanent`.
    async fn fail(&self, job_id: i64, error_message: &str, permanent: bool) -> Result<()>;

    /// Retry a single failed job: retry count reset to 0, error cleared.
    /// Returns false (and changes nothing) unless the job is currently failed.
    async fn retry_job(&self, job_id: i64) -> Result<bool>;

    /// Bulk-requeue every failed job. Retry counts and errors are kept.
    /// Returns the number of jobs moved.
    async fn retry_failed(&self) -> Result<u64>;

    /// Get a job by id.
    async fn get(&self, job_id: i64) -> Result<Option<Job>>;

    /// Point-in-time aggregate counts.
    async fn stats(&self) -> Result<QueueStats>;

    /// Dead-letter listing, most-recently-updated first.
    async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>>;

    /// Delete completed jobs whose `updated_at` is older than the cutoff.
    /// Returns the number deleted. Never touches failed jobs.
    async fn cleanup_completed(&self, older_than_hours: i64) -> Result<u64>;

    /// Count of outstanding work (pending + processing).
    async fn size(&self) -> Result<i64>;

    /// Administrative wipe of the whole job table.
    async fn clear(&self) -> Result<u64>;
}
