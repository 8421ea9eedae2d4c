//! # jobmill Core
//!
//! Engine logic that sits between callers, the storage backend and workers.
//!
//! - [`serializer`] - Versioned invocation envelope
//! - [`CapabilityRegistry`] - Maps `capability.operation` to typed handlers
//! - [`JobQueue`] - Enqueue, lease, acknowledge and release
//! - [`StateMachine`] - Retry policy, continuations, operator actions
//! - [`JobClient`] - Submission API
//! - [`CronExpr`] - Cron parsing and evaluation

pub mod client;
pub mod cron_expr;
pub mod queue;
pub mod registry;
pub mod serializer;
pub mod state_machine;
pub mod transient;

pub use client::{EnqueueOptions, JobClient, RecurringOptions};
pub use cron_expr::{Cron, CronExpr};
pub use queue::{JobQueue, LeaseGuard};
pub use registry::{CapabilityRegistry, OperationOptions, Registration};
pub use state_machine::{FailureOutcome, StateMachine};
pub use transient::TransientRetry;

/// Job parameter set on jobs created from a recurring entry.
pub const RECURRING_JOB_PARAM: &str = "recurring_job_id";

/// `at + delay`, saturating at the maximum representable instant.
pub fn offset(
    at: chrono::DateTime<chrono::Utc>,
    delay: std::time::Duration,
) -> chrono::DateTime<chrono::Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}
