//! SQLite job queue implementation.

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};

use async_trait::async_trait;
use quarry_core::{defaults, Error, Job, JobQueue, JobStatus, QueueStats, Result};

use crate::pool::create_pool;

/// Configuration for the persistent queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Storage location. `:memory:` yields a private in-memory database.
    pub db_path: String,
    /// Job table name, validated as a strict identifier at construction.
    pub table_name: String,
    /// Retry budget stamped onto every enqueued job.
    pub max_retries: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: defaults::DB_PATH.to_string(),
            table_name: defaults::TABLE_NAME.to_string(),
            max_retries: defaults::JOB_MAX_RETRIES,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUEUE_DB_PATH` | `./queue.db` | SQLite database location |
    /// | `QUEUE_TABLE` | `jobs` | Job table name |
    /// | `QUEUE_MAX_RETRIES` | `4` | Retry budget per job |
    pub fn from_env() -> Self {
        let db_path =
            std::env::var("QUEUE_DB_PATH").unwrap_or_else(|_| defaults::DB_PATH.to_string());

        let table_name =
            std::env::var("QUEUE_TABLE").unwrap_or_else(|_| defaults::TABLE_NAME.to_string());

        let max_retries = std::env::var("QUEUE_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults::JOB_MAX_RETRIES)
            .max(0);

        Self {
            db_path,
            table_name,
            max_retries,
        }
    }

    /// Set the database path.
    pub fn with_db_path(mut self, path: impl Into<String>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Set the job table name.
    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max: i32) -> Self {
        self.max_retries = max;
        self
    }
}

/// SQLite implementation of [`JobQueue`].
///
/// Every status transition is a single statement (or a short transaction),
/// so SQLite's single-writer serialization is what linearizes concurrent
/// claims; there is no application-level lock.
pub struct SqliteJobQueue {
    pool: SqlitePool,
    table: String,
    max_retries: i32,
}

/// Strict identifier check for configuration-supplied table names.
///
/// The table name is the only string ever interpolated into query text;
/// everything else is a bound parameter.
fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = name
        .chars()
        .skip(1)
        .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_first && valid_rest && name.len() <= 64 {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid table name {name:?}: must match [A-Za-z_][A-Za-z0-9_]*"
        )))
    }
}

/// Fixed-width RFC 3339 with microsecond precision, so lexicographic
/// comparison of stored timestamps equals chronological comparison.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("invalid timestamp {raw:?}: {e}")))
}

impl SqliteJobQueue {
    /// Open (or create) the queue at the configured location.
    pub async fn open(config: QueueConfig) -> Result<Self> {
        let pool = create_pool(&config.db_path).await?;
        Self::with_pool(pool, config).await
    }

    /// Build the queue on an existing pool, creating schema if needed.
    pub async fn with_pool(pool: SqlitePool, config: QueueConfig) -> Result<Self> {
        validate_identifier(&config.table_name)?;
        if config.max_retries < 0 {
            return Err(Error::Config(format!(
                "max_retries must be >= 0, got {}",
                config.max_retries
            )));
        }

        let queue = Self {
            pool,
            table: config.table_name,
            max_retries: config.max_retries,
        };
        queue.init_schema().await?;
        Ok(queue)
    }

    /// Access the underlying pool (tests, ad-hoc maintenance).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The retry budget stamped onto new jobs.
    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    async fn init_schema(&self) -> Result<()> {
        let t = &self.table;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 status TEXT NOT NULL,
                 retry_count INTEGER NOT NULL DEFAULT 0,
                 max_retries INTEGER NOT NULL,
                 error TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             )"
        ))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        for (index, columns) in [
            (format!("idx_{t}_status"), "status"),
            (format!("idx_{t}_created_at"), "created_at"),
            (format!("idx_{t}_status_created_at"), "status, created_at"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {t} ({columns})"
            ))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        }

        debug!(table = %t, "Job table schema ready");
        Ok(())
    }

    /// Convert JobStatus to string for the database.
    fn job_status_to_str(status: JobStatus) -> &'static str {
        match status {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Convert string from the database to JobStatus.
    fn str_to_job_status(s: &str) -> JobStatus {
        match s {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending, // fallback
        }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: SqliteRow) -> Result<Job> {
        let payload_raw: String = row.get("payload");
        let payload: JsonValue = serde_json::from_str(&payload_raw)?;
        let created_raw: String = row.get("created_at");
        let updated_raw: String = row.get("updated_at");
        let status_raw: String = row.get("status");

        Ok(Job {
            id: row.get("id"),
            name: row.get("name"),
            payload,
            status: Self::str_to_job_status(&status_raw),
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            error: row.get("error"),
            created_at: decode_ts(&created_raw)?,
            updated_at: decode_ts(&updated_raw)?,
        })
    }

    const JOB_COLUMNS: &'static str =
        "id, name, payload, status, retry_count, max_retries, error, created_at, updated_at";
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, name: &str, payload: JsonValue) -> Result<Job> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("job name cannot be empty".to_string()));
        }
        let payload_text = serde_json::to_string(&payload)
            .map_err(|e| Error::InvalidInput(format!("payload is not serializable: {e}")))?;

        // Truncate to stored precision so the returned job's timestamps
        // compare equal to what a later read will produce.
        let now = Utc::now().trunc_subsecs(6);
        let now_str = encode_ts(now);

        let id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {} (name, payload, status, retry_count, max_retries, created_at, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4)
             RETURNING id",
            self.table
        ))
        .bind(name)
        .bind(&payload_text)
        .bind(self.max_retries)
        .bind(&now_str)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(job_id = id, job_name = name, "Job enqueued");

        Ok(Job {
            id,
            name: name.to_string(),
            payload,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn claim(&self) -> Result<Option<Job>> {
        let now_str = encode_ts(Utc::now());

        // Selection and update are one statement, so SQLite's write
        // serialization guarantees no two callers get the same row.
        let row = sqlx::query(&format!(
            "UPDATE {t}
             SET status = 'processing', updated_at = ?1
             WHERE id = (
                 SELECT id FROM {t}
                 WHERE status = 'pending'
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING {cols}",
            t = self.table,
            cols = Self::JOB_COLUMNS
        ))
        .bind(&now_str)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn complete(&self, job_id: i64) -> Result<()> {
        let now_str = encode_ts(Utc::now());

        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'completed', updated_at = ?1 WHERE id = ?2",
            self.table
        ))
        .bind(&now_str)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            // Benign race: the job may already have been swept. A throwing
            // caller could not act on it anyway.
            warn!(job_id, "complete() called for unknown job id");
        }
        Ok(())
    }

    async fn fail(&self, job_id: i64, error_message: &str, permanent: bool) -> Result<()> {
        let now_str = encode_ts(Utc::now());

        // One statement, like claim(): a read-then-write transaction would
        // lose its WAL snapshot to any concurrent commit and surface
        // SQLITE_BUSY_SNAPSHOT, stranding the job in processing. The
        // retry count is clamped so an i32::MAX budget cannot overflow.
        let outcome: Option<(i32, String)> = sqlx::query_as(&format!(
            "UPDATE {t}
             SET retry_count = MIN(CASE WHEN ?1 THEN max_retries ELSE retry_count END + 1, {max}),
                 status = CASE WHEN ?1 OR retry_count + 1 > max_retries
                               THEN 'failed' ELSE 'pending' END,
                 error = ?2,
                 updated_at = ?3
             WHERE id = ?4
             RETURNING retry_count, status",
            t = self.table,
            max = i32::MAX
        ))
        .bind(permanent)
        .bind(error_message)
        .bind(&now_str)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some((retry_count, status)) = outcome else {
            warn!(job_id, "fail() called for unknown job id");
            return Ok(());
        };

        debug!(job_id, retry_count, status = %status, "Job failure recorded");
        Ok(())
    }

    async fn retry_job(&self, job_id: i64) -> Result<bool> {
        let now_str = encode_ts(Utc::now());

        let result = sqlx::query(&format!(
            "UPDATE {}
             SET status = 'pending', retry_count = 0, error = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'failed'",
            self.table
        ))
        .bind(&now_str)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn retry_failed(&self) -> Result<u64> {
        let now_str = encode_ts(Utc::now());

        // Bulk retry keeps retry_count and error so operators can still see
        // the prior failure history after the requeue.
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'pending', updated_at = ?1 WHERE status = 'failed'",
            self.table
        ))
        .bind(&now_str)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn get(&self, job_id: i64) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {cols} FROM {t} WHERE id = ?1",
            cols = Self::JOB_COLUMNS,
            t = self.table
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(&format!(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total
             FROM {}",
            self.table
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get::<i64, _>("pending"),
            processing: row.get::<i64, _>("processing"),
            completed: row.get::<i64, _>("completed"),
            failed: row.get::<i64, _>("failed"),
            total: row.get::<i64, _>("total"),
        })
    }

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {cols} FROM {t}
             WHERE status = 'failed'
             ORDER BY updated_at DESC, id DESC
             LIMIT ?1",
            cols = Self::JOB_COLUMNS,
            t = self.table
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn cleanup_completed(&self, older_than_hours: i64) -> Result<u64> {
        let cutoff = encode_ts(Utc::now() - Duration::hours(older_than_hours));

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE status = 'completed' AND updated_at < ?1",
            self.table
        ))
        .bind(&cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn size(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE status IN ('pending', 'processing')",
            self.table
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
