//! # quarry-db
//!
//! SQLite persistence layer for the quarry job queue.
//!
//! This crate provides:
//! - Connection pool management (WAL mode, busy timeout, `:memory:` support)
//! - [`SqliteJobQueue`], the durable [`quarry_core::JobQueue`] implementation
//!
//! ## Example
//!
//! ```rust,ignore
//! use quarry_core::JobQueue;
//! use quarry_db::{QueueConfig, SqliteJobQueue};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = SqliteJobQueue::open(QueueConfig::default()).await?;
//!
//!     let job = queue.enqueue("process_batch", json!({"batch": 17})).await?;
//!     println!("Enqueued job: {}", job.id);
//!     Ok(())
//! }
//! ```

pub mod pool;
pub mod queue;

pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use queue::{QueueConfig, SqliteJobQueue};
