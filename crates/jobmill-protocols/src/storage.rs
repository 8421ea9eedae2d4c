//! Storage backend contract.
//!
//! The backend is the only synchronization point between workers, schedulers
//! and operators. Every state change goes through [`Storage::update_state`]
//! with a [`Transition`] guard so that concurrent writers never both win.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::job::{JobId, JobRecord, JobState, StateName};
use crate::schedule::{RecurringFire, ScheduleEntry};

/// A guarded state change.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Accepted current states. Empty accepts any state.
    pub from: Vec<StateName>,
    /// Required lease holder when the job is processing.
    pub lease_holder: Option<String>,
    /// Require the current lease to have expired at this instant.
    pub lease_expired_at: Option<DateTime<Utc>>,
    pub to: JobState,
    pub reason: Option<String>,
}

impl Transition {
    pub fn to(state: JobState) -> Self {
        Self {
            from: Vec::new(),
            lease_holder: None,
            lease_expired_at: None,
            to: state,
            reason: None,
        }
    }

    pub fn from_states(mut self, states: &[StateName]) -> Self {
        self.from = states.to_vec();
        self
    }

    pub fn held_by(mut self, worker_id: impl Into<String>) -> Self {
        self.lease_holder = Some(worker_id.into());
        self
    }

    pub fn lease_expired_at(mut self, now: DateTime<Utc>) -> Self {
        self.lease_expired_at = Some(now);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Verify the guard against the record's current state.
    pub fn check(&self, record: &JobRecord) -> Result<(), StorageError> {
        let current = record.state_name();
        if !self.from.is_empty() && !self.from.contains(&current) {
            return Err(StorageError::conflict(
                record.id,
                format!("job is {}, expected one of {:?}", current, self.from),
            ));
        }
        if let Some(holder) = &self.lease_holder {
            match record.state.lease_holder() {
                Some(actual) if actual == holder => {}
                Some(actual) => {
                    return Err(StorageError::conflict(
                        record.id,
                        format!("lease held by {}", actual),
                    ));
                }
                None => {
                    return Err(StorageError::conflict(record.id, "job holds no lease"));
                }
            }
        }
        if let Some(now) = self.lease_expired_at {
            match record.state.lease_expires_at() {
                Some(expires) if expires <= now => {}
                _ => return Err(StorageError::conflict(record.id, "lease still valid")),
            }
        }
        Ok(())
    }

    /// Check the guard and apply the new state to `record`.
    pub fn apply_to(&self, record: &mut JobRecord, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.check(record)?;
        record.apply(self.to.clone(), self.reason.clone(), at)
    }
}

/// Where a job released for another attempt waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRoute {
    /// Straight back onto its queue.
    Requeue,
    /// Behind a run-at entry for the failure's `retry_at`.
    RunAt,
}

impl RetryRoute {
    /// Apply a retry release to `record`.
    ///
    /// Runs the guarded `Failed` transition, then the requeue for
    /// [`RetryRoute::Requeue`]. Returns the run-at entry the backend must
    /// store for [`RetryRoute::RunAt`].
    pub fn apply_to(
        self,
        transition: &Transition,
        record: &mut JobRecord,
        at: DateTime<Utc>,
    ) -> Result<Option<ScheduleEntry>, StorageError> {
        let Some(retry_at) = transition.to.retry_at() else {
            return Err(StorageError::conflict(
                record.id,
                "retry release needs a failed state with retry_at",
            ));
        };
        transition.apply_to(record, at)?;
        match self {
            RetryRoute::Requeue => {
                let queue = record.queue.clone();
                record.apply(JobState::Enqueued { queue }, Some("retry".to_string()), at)?;
                Ok(None)
            }
            RetryRoute::RunAt => Ok(Some(ScheduleEntry::run_at(record.id, retry_at))),
        }
    }
}

/// One-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub per_page: u32,
}

impl Page {
    pub const MAX_PER_PAGE: u32 = 500;

    pub fn new(number: u32, per_page: u32) -> Self {
        Self {
            number: number.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.number.max(1) as usize - 1) * self.per_page as usize
    }

    pub fn limit(&self) -> usize {
        self.per_page as usize
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// Ready length of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub enqueued: u64,
}

/// Job counts keyed by state.
pub type StateCounts = BTreeMap<StateName, u64>;

/// Durable store for jobs, queues and schedule entries.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Insert a new job. Enqueued jobs join their queue's ready index.
    async fn put(&self, record: JobRecord) -> Result<JobId, StorageError>;

    async fn get(&self, id: &JobId) -> Result<JobRecord, StorageError>;

    /// Guarded state change; returns the updated record.
    async fn update_state(&self, id: &JobId, transition: Transition)
        -> Result<JobRecord, StorageError>;

    async fn set_parameter(
        &self,
        id: &JobId,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StorageError>;

    /// Jobs in `state` (any state when `None`), most recently updated first.
    async fn list_by_state(
        &self,
        state: Option<StateName>,
        queue: Option<&str>,
        page: Page,
    ) -> Result<Vec<JobRecord>, StorageError>;

    async fn count_by_state(&self, queue: Option<&str>) -> Result<StateCounts, StorageError>;

    /// Queues that have ever held a job, with their ready lengths.
    async fn list_queues(&self) -> Result<Vec<QueueInfo>, StorageError>;

    /// Atomically claim the oldest ready job of `queue`.
    ///
    /// Moves it to `Processing` with the given lease and increments its
    /// attempt count. Returns `None` if the queue is empty.
    async fn acquire_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, StorageError>;

    /// Extend a lease. Returns `false` if `worker_id` no longer holds it.
    async fn renew_lease(
        &self,
        id: &JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StorageError>;

    /// Processing jobs whose lease expired at or before `now`.
    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError>;

    /// Failed jobs with no pending retry, last updated before `cutoff`.
    async fn exhausted_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError>;

    /// Apply a `Failed { retry_at: Some(..) }` transition and queue the next
    /// attempt in the same write.
    ///
    /// Either both happen or neither does, so a failed call can be retried.
    async fn fail_with_retry(
        &self,
        id: &JobId,
        transition: Transition,
        route: RetryRoute,
    ) -> Result<JobRecord, StorageError>;

    /// Insert `child` and attach it to `parent`'s continuation list.
    ///
    /// Atomic with respect to the parent's transitions; the child is not
    /// stored if the parent is missing. Returns the parent's state at the time
    /// of attaching so the caller can resolve a parent that already finished.
    async fn add_continuation(
        &self,
        parent: &JobId,
        child: JobRecord,
    ) -> Result<StateName, StorageError>;

    /// Insert or replace a schedule entry by id.
    async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<(), StorageError>;

    /// Register a recurring entry, merged against the stored copy under the
    /// same lock. See [`ScheduleEntry::merge_existing`].
    ///
    /// Returns the entry as stored. Fails with a conflict if the id belongs
    /// to a non-recurring entry.
    async fn upsert_recurring(&self, entry: ScheduleEntry)
        -> Result<ScheduleEntry, StorageError>;

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>, StorageError>;

    /// Returns `true` if an entry was removed.
    async fn remove_schedule(&self, id: &str) -> Result<bool, StorageError>;

    /// Entries with `next_fire <= now`, earliest first.
    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleEntry>, StorageError>;

    /// All entries; recurring only when `recurring_only`.
    async fn list_schedules(&self, recurring_only: bool)
        -> Result<Vec<ScheduleEntry>, StorageError>;

    /// Advance a recurring entry's watermark if its `next_fire` still equals
    /// `expected`. Returns `false` when another scheduler got there first.
    async fn advance_recurring(
        &self,
        id: &str,
        expected: Option<DateTime<Utc>>,
        fire: RecurringFire,
    ) -> Result<bool, StorageError>;
}
