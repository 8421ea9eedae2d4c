//! Job lifecycle: outcomes, retries, continuations and operator actions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use jobmill_protocols::{
    ExhaustedAction, FailureKind, JobError, JobId, JobRecord, JobState, RetryPolicy, StateName,
    Storage, StorageError, Transition,
};

use crate::queue::{JobQueue, LeaseGuard};
use crate::registry::CapabilityRegistry;

/// What happened to a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Another attempt follows after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// No attempts left; the job stays `Failed` for the operator.
    Exhausted { attempt: u32 },
    /// No attempts left and the policy deleted the job.
    Deleted { attempt: u32 },
}

/// Applies retry policies and continuation rules on top of storage.
pub struct StateMachine {
    storage: Arc<dyn Storage>,
    queue: JobQueue,
    registry: Arc<CapabilityRegistry>,
    default_policy: RetryPolicy,
}

impl StateMachine {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<CapabilityRegistry>,
        default_policy: RetryPolicy,
    ) -> Self {
        Self {
            queue: JobQueue::new(storage.clone()),
            storage,
            registry,
            default_policy,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Instance policy, then the operation's registered policy, then the default.
    pub fn policy_for(&self, record: &JobRecord) -> RetryPolicy {
        record
            .retry_policy
            .clone()
            .or_else(|| {
                self.registry
                    .options_for(&record.display_name)
                    .and_then(|options| options.retry_policy)
            })
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// Record a successful attempt and enqueue the job's continuations.
    pub async fn succeed(
        &self,
        id: &JobId,
        worker_id: &str,
        result: Value,
        duration: Duration,
    ) -> Result<JobRecord, JobError> {
        let record = self.queue.acknowledge(id, worker_id, result, duration).await?;
        debug!("Job {} ({}) succeeded in {:?}", id, record.display_name, duration);
        self.trigger_continuations(&record).await?;
        Ok(record)
    }

    /// Enqueue every awaiting continuation of a succeeded parent.
    pub async fn trigger_continuations(&self, parent: &JobRecord) -> Result<usize, JobError> {
        if parent.state_name() != StateName::Succeeded {
            return Ok(0);
        }
        let mut enqueued = 0;
        for child in &parent.continuations {
            let record = match self.storage.get(child).await {
                Ok(record) => record,
                Err(StorageError::NotFound(_)) => {
                    warn!("Continuation {} of job {} is missing", child, parent.id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let transition = Transition::to(JobState::Enqueued {
                queue: record.queue.clone(),
            })
            .from_states(&[StateName::Awaiting])
            .with_reason(format!("parent {} succeeded", parent.id));
            match self.storage.update_state(child, transition).await {
                Ok(_) => {
                    debug!("Continuation {} enqueued after {}", child, parent.id);
                    enqueued += 1;
                }
                Err(StorageError::Conflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(enqueued)
    }

    /// Record a failed attempt and apply the retry policy.
    pub async fn fail(
        &self,
        id: &JobId,
        guard: &LeaseGuard,
        error: &JobError,
    ) -> Result<FailureOutcome, JobError> {
        let kind = error.failure_kind().unwrap_or(FailureKind::Payload);
        let message = error.failure_message();
        let record = self.storage.get(id).await?;
        let policy = self.policy_for(&record);
        let attempt = record.attempts;

        if kind.is_retryable() && policy.should_retry(attempt) {
            let delay = policy.delay_for_attempt(attempt);
            self.queue.release(id, guard, kind, message, delay).await?;
            warn!(
                "Job {} ({}) failed on attempt {}/{}: {}; retrying in {:?}",
                id, record.display_name, attempt, policy.max_attempts, error, delay
            );
            return Ok(FailureOutcome::Retrying { attempt, delay });
        }

        let reason = if kind.is_retryable() {
            format!("retries exhausted after {} attempts", attempt)
        } else {
            format!("{} failures are not retried", kind.as_str())
        };
        let transition = guard
            .transition(JobState::Failed {
                kind,
                message,
                attempt,
                retry_at: None,
            })
            .with_reason(reason.clone());
        self.storage.update_state(id, transition).await?;
        error!("Job {} ({}) failed permanently: {} ({})", id, record.display_name, error, reason);

        match policy.on_exhausted {
            ExhaustedAction::Keep => Ok(FailureOutcome::Exhausted { attempt }),
            ExhaustedAction::Delete => {
                self.delete(id, "retries exhausted").await?;
                Ok(FailureOutcome::Deleted { attempt })
            }
        }
    }

    /// Move a scheduled job, or a failed job awaiting retry, into its queue.
    ///
    /// Returns `false` when the job is gone or no longer eligible.
    pub async fn promote(&self, id: &JobId) -> Result<bool, JobError> {
        let record = match self.storage.get(id).await {
            Ok(record) => record,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if record.state.is_exhausted() {
            return Ok(false);
        }
        let reason = match record.state_name() {
            StateName::Failed => "retry",
            _ => "scheduled time reached",
        };
        let transition = Transition::to(JobState::Enqueued {
            queue: record.queue.clone(),
        })
        .from_states(&[StateName::Scheduled, StateName::Failed])
        .with_reason(reason);
        match self.storage.update_state(id, transition).await {
            Ok(_) => {
                debug!("Job {} promoted to {}", id, record.queue);
                Ok(true)
            }
            Err(StorageError::Conflict { .. }) | Err(StorageError::InvalidTransition { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Operator re-enqueue of a failed or scheduled job.
    pub async fn requeue(&self, id: &JobId) -> Result<JobRecord, JobError> {
        let record = self.storage.get(id).await?;
        let transition = Transition::to(JobState::Enqueued {
            queue: record.queue.clone(),
        })
        .from_states(&[StateName::Failed, StateName::Scheduled])
        .with_reason("requeued by operator");
        let record = self.storage.update_state(id, transition).await?;
        self.storage.remove_schedule(&id.to_string()).await?;
        info!("Job {} requeued on {}", id, record.queue);
        Ok(record)
    }

    /// Delete a job that has not finished, cascading to awaiting continuations.
    pub async fn delete(&self, id: &JobId, reason: &str) -> Result<JobRecord, JobError> {
        let transition = Transition::to(JobState::Deleted {
            reason: Some(reason.to_string()),
        })
        .from_states(&[
            StateName::Scheduled,
            StateName::Awaiting,
            StateName::Enqueued,
            StateName::Processing,
            StateName::Failed,
        ])
        .with_reason(reason);
        let record = self.storage.update_state(id, transition).await?;
        self.storage.remove_schedule(&id.to_string()).await?;
        info!("Job {} deleted: {}", id, reason);
        self.cancel_continuations(&record).await?;
        Ok(record)
    }

    /// Delete the awaiting descendants of a deleted job.
    async fn cancel_continuations(&self, parent: &JobRecord) -> Result<(), JobError> {
        let mut pending: Vec<(JobId, JobId)> =
            parent.continuations.iter().map(|c| (parent.id, *c)).collect();
        while let Some((parent_id, child)) = pending.pop() {
            let transition = Transition::to(JobState::Deleted {
                reason: Some(format!("parent {} deleted", parent_id)),
            })
            .from_states(&[StateName::Awaiting])
            .with_reason("parent deleted");
            match self.storage.update_state(&child, transition).await {
                Ok(record) => {
                    debug!("Continuation {} deleted with parent {}", child, parent_id);
                    pending.extend(record.continuations.iter().map(|c| (child, *c)));
                }
                Err(StorageError::Conflict { .. }) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Send expired leases through the retry path as `LeaseExpired`.
    pub async fn recover_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, JobError> {
        let expired = self.storage.expired_leases(now, limit).await?;
        let mut recovered = 0;
        for record in expired {
            let holder = record.state.lease_holder().unwrap_or("unknown").to_string();
            match self
                .fail(&record.id, &LeaseGuard::ExpiredAt(now), &JobError::LeaseExpired)
                .await
            {
                Ok(outcome) => {
                    warn!(
                        "Lease of job {} held by {} expired: {:?}",
                        record.id, holder, outcome
                    );
                    recovered += 1;
                }
                Err(JobError::InvalidOperation(reason)) => {
                    debug!("Job {} changed while reaping: {}", record.id, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Delete exhausted failures last updated before `cutoff`.
    pub async fn sweep_exhausted(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, JobError> {
        let exhausted = self.storage.exhausted_before(cutoff, limit).await?;
        let mut deleted = 0;
        for record in exhausted {
            match self.delete(&record.id, "retention window elapsed").await {
                Ok(_) => deleted += 1,
                Err(JobError::InvalidOperation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
#[path = "state_machine_tests.rs"]
mod tests;
