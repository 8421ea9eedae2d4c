//! Queue and dispatch: enqueue, lease, acknowledge, release.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use jobmill_protocols::{
    FailureKind, Invocation, JobError, JobId, JobRecord, JobState, RetryPolicy, RetryRoute,
    StateName, Storage, Transition,
};

use crate::serializer;

/// Who may move a processing job out of `Processing`.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseGuard {
    /// The worker holding the lease.
    Holder(String),
    /// Anyone, once the lease has expired at this instant.
    ExpiredAt(DateTime<Utc>),
}

impl LeaseGuard {
    pub fn holder(worker_id: impl Into<String>) -> Self {
        LeaseGuard::Holder(worker_id.into())
    }

    /// Guarded transition out of `Processing`.
    pub fn transition(&self, to: JobState) -> Transition {
        let transition = Transition::to(to).from_states(&[StateName::Processing]);
        match self {
            LeaseGuard::Holder(worker_id) => transition.held_by(worker_id.clone()),
            LeaseGuard::ExpiredAt(now) => transition.lease_expired_at(*now),
        }
    }
}

/// Per-queue dispatch over a storage backend.
///
/// A leased job is invisible to other `lease` calls until it is
/// acknowledged, released, or its lease expires and the reaper returns it.
#[derive(Clone)]
pub struct JobQueue {
    storage: Arc<dyn Storage>,
}

impl JobQueue {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Persist a new job directly in `Enqueued`.
    pub async fn enqueue(&self, invocation: &Invocation, queue: &str) -> Result<JobId, JobError> {
        self.enqueue_with(invocation, queue, None, HashMap::new()).await
    }

    pub async fn enqueue_with(
        &self,
        invocation: &Invocation,
        queue: &str,
        retry_policy: Option<RetryPolicy>,
        parameters: HashMap<String, Value>,
    ) -> Result<JobId, JobError> {
        let payload = serializer::encode_invocation(invocation)?;
        let mut record = JobRecord::new(
            invocation.display_name(),
            payload,
            queue,
            JobState::Enqueued {
                queue: queue.to_string(),
            },
        );
        record.retry_policy = retry_policy;
        record.parameters = parameters;
        let id = self.storage.put(record).await?;
        debug!("Enqueued job {} ({}) on {}", id, invocation.display_name(), queue);
        Ok(id)
    }

    /// Claim the next ready job of `queue`. Non-blocking.
    pub async fn lease(
        &self,
        queue: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<JobRecord>, JobError> {
        Ok(self.storage.acquire_lease(queue, worker_id, timeout).await?)
    }

    /// Extend a held lease. `false` means it was lost.
    pub async fn renew(
        &self,
        id: &JobId,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<bool, JobError> {
        Ok(self.storage.renew_lease(id, worker_id, timeout).await?)
    }

    /// Finalize a successful attempt.
    pub async fn acknowledge(
        &self,
        id: &JobId,
        worker_id: &str,
        result: Value,
        duration: Duration,
    ) -> Result<JobRecord, JobError> {
        let transition = LeaseGuard::holder(worker_id).transition(JobState::Succeeded {
            result,
            duration_ms: duration.as_millis() as u64,
        });
        Ok(self.storage.update_state(id, transition).await?)
    }

    /// Return a processing job to its queue after `delay`.
    ///
    /// The job is recorded as `Failed` with a pending retry. A zero delay
    /// re-enqueues immediately, otherwise a run-at entry hands it to the
    /// scheduler. Both happen in one storage write.
    pub async fn release(
        &self,
        id: &JobId,
        guard: &LeaseGuard,
        kind: FailureKind,
        message: Option<String>,
        delay: Duration,
    ) -> Result<JobRecord, JobError> {
        let now = Utc::now();
        let retry_at = crate::offset(now, delay);
        let record = self.storage.get(id).await?;
        let failed = guard.transition(JobState::Failed {
            kind,
            message,
            attempt: record.attempts,
            retry_at: Some(retry_at),
        });
        let route = if delay.is_zero() {
            RetryRoute::Requeue
        } else {
            RetryRoute::RunAt
        };
        let record = self.storage.fail_with_retry(id, failed, route).await?;
        debug!("Job {} will retry at {}", id, retry_at);
        Ok(record)
    }
}
