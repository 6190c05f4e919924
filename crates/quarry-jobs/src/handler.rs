//! Job handler trait and helpers.

use async_trait::async_trait;

use quarry_core::Job;

/// Trait for caller-supplied job handlers.
///
/// The handler interprets `job.name` and `job.payload`; the pool treats
/// any `Ok(())` as success and any error as a (non-permanent) failure.
/// Handlers run inside spawned tasks and never block the polling loop.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one claimed job.
    async fn execute(&self, job: Job) -> anyhow::Result<()>;
}

/// No-op handler for testing: succeeds on every job.
pub struct NoOpHandler;

#[async_trait]
impl JobHandler for NoOpHandler {
    async fn execute(&self, _job: Job) -> anyhow::Result<()> {
        Ok(())
    }
}
