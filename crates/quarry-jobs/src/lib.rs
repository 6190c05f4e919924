//! # quarry-jobs
//!
//! Worker pool and maintenance scheduler for the quarry job queue.
//!
//! This crate provides:
//! - [`JobHandler`], the trait callers implement per job type
//! - [`WorkerPool`], a concurrency-bounded set of pollers with health
//!   gating, graceful drain-on-shutdown, and a broadcast event bus
//! - [`Scheduler`], a timer that periodically sweeps old completed jobs
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use quarry_db::{QueueConfig, SqliteJobQueue};
//! use quarry_jobs::{JobHandler, Scheduler, SchedulerConfig, WorkerConfig, WorkerPool};
//!
//! let queue = Arc::new(SqliteJobQueue::open(QueueConfig::default()).await?);
//!
//! let pool = WorkerPool::new(
//!     queue.clone(),
//!     Arc::new(MyHandler),
//!     WorkerConfig::default().with_concurrency(4),
//! );
//! pool.start();
//!
//! let scheduler = Scheduler::new(queue.clone(), SchedulerConfig::default());
//! scheduler.start();
//!
//! // ... serve requests, enqueue work ...
//!
//! scheduler.stop().await;
//! pool.stop().await; // drains in-flight jobs
//! ```

pub mod handler;
pub mod scheduler;
pub mod worker;

// Re-export core types
pub use quarry_core::*;

pub use handler::{JobHandler, NoOpHandler};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use worker::{HealthCheck, WorkerConfig, WorkerEvent, WorkerPool, WorkerPoolBuilder};
