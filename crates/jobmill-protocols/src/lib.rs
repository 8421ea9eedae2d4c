//! # jobmill Protocols
//!
//! Data model and contracts shared by every jobmill crate.
//! Contains no engine logic beyond the state machine's transition table.
//!
//! ## Core Types
//!
//! - [`JobRecord`] - A persisted job with its state history
//! - [`JobState`] - Tagged lifecycle state
//! - [`ScheduleEntry`] - One-shot or recurring schedule definition
//! - [`RetryPolicy`] - Attempt limit and backoff function
//! - [`Storage`] - Trait for storage backends
//! - [`OperationHandler`] - Trait for registered capability operations

pub mod capability;
pub mod error;
pub mod invocation;
pub mod job;
pub mod retry;
pub mod schedule;
pub mod storage;

pub use capability::{Heartbeat, JobContext, OperationHandler};
pub use error::{JobError, StorageError};
pub use invocation::{Invocation, Payload};
pub use job::{
    FailureKind, JobId, JobRecord, JobState, JobSummary, StateHistoryEntry, StateName,
};
pub use retry::{Backoff, ExhaustedAction, RetryPolicy};
pub use schedule::{RecurringFire, ScheduleEntry, ScheduleKind};
pub use storage::{Page, QueueInfo, RetryRoute, StateCounts, Storage, Transition};

/// Name of the queue used when a caller does not pick one.
pub const DEFAULT_QUEUE: &str = "default";
