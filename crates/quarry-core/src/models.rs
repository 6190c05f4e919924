//! Core data types for the quarry job queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A unit of deferred work persisted in the job table.
///
/// The store is the single source of truth for job state; no in-process
/// copy of a `Job` is authoritative after it has been handed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned, monotonically increasing identifier.
    pub id: i64,
    /// Job type name, opaque to the queue (interpreted by the handler).
    pub name: String,
    /// Arbitrary JSON payload, persisted as text.
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Number of failure attempts recorded so far.
    pub retry_count: i32,
    /// Retry budget, fixed at enqueue time from queue configuration.
    pub max_retries: i32,
    /// Last recorded failure reason, cleared only by single-job retry.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue statistics summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}
