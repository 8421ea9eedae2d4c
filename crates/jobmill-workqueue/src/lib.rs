//! # jobmill Workqueue
//!
//! Worker pool for jobmill.
//!
//! ## Features
//!
//! - N execution slots, each polling its queues in priority order
//! - Automatic lease renewal while a job runs
//! - Cooperative cancellation on lost leases and shutdown
//! - Panics inside a job recorded as failed attempts

pub mod config;
pub mod heartbeat;
pub mod worker;

pub use config::WorkerConfig;
pub use heartbeat::LeaseHeartbeat;
pub use worker::{JobOutcome, PoolStats, PoolStatsSnapshot, WorkerPool};
