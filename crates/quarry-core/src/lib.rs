//! # quarry-core
//!
//! Core types and traits for the quarry job queue:
//! - [`Job`], [`JobStatus`], [`QueueStats`] data types
//! - The [`JobQueue`] trait implemented by the persistence layer
//! - The [`Error`]/[`Result`] taxonomy shared by all crates
//! - [`defaults`] constants (single source of truth for magic numbers)

pub mod defaults;
pub mod error;
pub mod models;
pub mod traits;

pub use error::{Error, Result};
pub use models::{Job, JobStatus, QueueStats};
pub use traits::JobQueue;
