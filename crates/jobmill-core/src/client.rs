//! Submission API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info};

use jobmill_protocols::{
    DEFAULT_QUEUE, Invocation, JobError, JobId, JobRecord, JobState, RetryPolicy, ScheduleEntry,
    ScheduleKind, StateName, Storage,
};

use crate::cron_expr::CronExpr;
use crate::registry::CapabilityRegistry;
use crate::serializer;
use crate::state_machine::StateMachine;
use crate::RECURRING_JOB_PARAM;

/// Options for a submitted job.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Queue name; falls back to the operation's registered queue, then `default`.
    pub queue: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub parameters: HashMap<String, Value>,
}

impl EnqueueOptions {
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Default::default()
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// Options for a recurring entry.
#[derive(Debug, Clone)]
pub struct RecurringOptions {
    pub queue: Option<String>,
    /// `UTC` or a fixed offset such as `+05:30`.
    pub timezone: String,
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for RecurringOptions {
    fn default() -> Self {
        Self {
            queue: None,
            timezone: "UTC".to_string(),
            retry_policy: None,
        }
    }
}

/// Builds jobs and schedule entries and hands them to storage.
#[derive(Clone)]
pub struct JobClient {
    storage: Arc<dyn Storage>,
    registry: Arc<CapabilityRegistry>,
    state: Arc<StateMachine>,
}

impl JobClient {
    pub fn new(state: Arc<StateMachine>) -> Self {
        Self {
            storage: state.storage().clone(),
            registry: state.registry().clone(),
            state,
        }
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state
    }

    fn resolve_queue(&self, invocation: &Invocation, requested: Option<String>) -> String {
        requested
            .or_else(|| {
                self.registry
                    .options_for(&invocation.display_name())
                    .and_then(|options| options.queue)
            })
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string())
    }

    fn build(
        &self,
        invocation: &Invocation,
        options: EnqueueOptions,
        initial: impl FnOnce(&str) -> JobState,
    ) -> Result<JobRecord, JobError> {
        let payload = serializer::encode_invocation(invocation)?;
        let queue = self.resolve_queue(invocation, options.queue);
        let mut record = JobRecord::new(invocation.display_name(), payload, &queue, initial(&queue));
        record.retry_policy = options.retry_policy;
        record.parameters = options.parameters;
        Ok(record)
    }

    /// Enqueue `capability.operation(args)` on its default queue.
    pub async fn enqueue(
        &self,
        capability: &str,
        operation: &str,
        args: Value,
    ) -> Result<JobId, JobError> {
        self.enqueue_invocation(
            &Invocation::new(capability, operation, args),
            EnqueueOptions::default(),
        )
        .await
    }

    pub async fn enqueue_invocation(
        &self,
        invocation: &Invocation,
        options: EnqueueOptions,
    ) -> Result<JobId, JobError> {
        let record = self.build(invocation, options, |queue| JobState::Enqueued {
            queue: queue.to_string(),
        })?;
        let queue = record.queue.clone();
        let id = self.storage.put(record).await?;
        info!("Enqueued job {} ({}) on {}", id, invocation.display_name(), queue);
        Ok(id)
    }

    /// Run once after `delay`.
    pub async fn schedule(
        &self,
        invocation: &Invocation,
        delay: Duration,
        options: EnqueueOptions,
    ) -> Result<JobId, JobError> {
        self.schedule_at(invocation, crate::offset(Utc::now(), delay), options)
            .await
    }

    /// Run once at `run_at`.
    pub async fn schedule_at(
        &self,
        invocation: &Invocation,
        run_at: DateTime<Utc>,
        options: EnqueueOptions,
    ) -> Result<JobId, JobError> {
        let record = self.build(invocation, options, |_| JobState::Scheduled {
            enqueue_at: run_at,
        })?;
        let id = self.storage.put(record).await?;
        self.storage
            .upsert_schedule(ScheduleEntry::run_at(id, run_at))
            .await?;
        info!("Scheduled job {} ({}) for {}", id, invocation.display_name(), run_at);
        Ok(id)
    }

    /// Run after `parent` succeeds.
    ///
    /// A parent that already succeeded enqueues the child at once; a deleted
    /// parent deletes it.
    pub async fn continue_with(
        &self,
        parent: &JobId,
        invocation: &Invocation,
        options: EnqueueOptions,
    ) -> Result<JobId, JobError> {
        let parent_id = *parent;
        let record = self.build(invocation, options, |_| JobState::Awaiting { parent: parent_id })?;
        let id = record.id;

        let parent_state = self.storage.add_continuation(parent, record).await?;
        match parent_state {
            StateName::Succeeded => {
                let parent_record = self.storage.get(parent).await?;
                self.state.trigger_continuations(&parent_record).await?;
            }
            StateName::Deleted => {
                self.state
                    .delete(&id, &format!("parent {} deleted", parent))
                    .await?;
            }
            _ => {}
        }
        info!("Job {} ({}) continues {}", id, invocation.display_name(), parent);
        Ok(id)
    }

    /// Create or replace a recurring entry by id.
    ///
    /// Re-registering with the same id never duplicates the entry; its firing
    /// watermark survives unless the cron expression or timezone changed.
    pub async fn add_or_update_recurring(
        &self,
        id: &str,
        invocation: &Invocation,
        cron: &str,
        options: RecurringOptions,
    ) -> Result<ScheduleEntry, JobError> {
        if id.trim().is_empty() {
            return Err(JobError::InvalidOperation("recurring id is empty".to_string()));
        }
        let expr = CronExpr::parse(cron, &options.timezone)?;
        let now = Utc::now();
        let entry = ScheduleEntry {
            id: id.to_string(),
            kind: ScheduleKind::Recurring {
                cron: expr.source().to_string(),
                timezone: options.timezone.clone(),
                payload: serializer::encode_invocation(invocation)?,
                display_name: invocation.display_name(),
                queue: self.resolve_queue(invocation, options.queue),
                retry_policy: options.retry_policy,
                last_fired: None,
                last_job_id: None,
                last_error: None,
            },
            next_fire: expr.next_after(now),
            created_at: now,
            updated_at: now,
        };
        let entry = self.storage.upsert_recurring(entry).await?;
        info!(
            "Recurring job {} ({}) registered with cron {:?}, next fire {:?}",
            id,
            invocation.display_name(),
            cron,
            entry.next_fire
        );
        Ok(entry)
    }

    /// Returns `true` if the entry existed.
    pub async fn remove_recurring(&self, id: &str) -> Result<bool, JobError> {
        match self.storage.get_schedule(id).await? {
            Some(entry) if entry.is_recurring() => {
                let removed = self.storage.remove_schedule(id).await?;
                info!("Recurring job {} removed", id);
                Ok(removed)
            }
            _ => Ok(false),
        }
    }

    /// Enqueue a recurring entry now without moving its watermark.
    pub async fn trigger_recurring(&self, id: &str) -> Result<JobId, JobError> {
        let entry = self
            .storage
            .get_schedule(id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("recurring job {}", id)))?;
        let record = recurring_job(&entry)?;
        let job_id = self.storage.put(record).await?;
        debug!("Recurring job {} triggered as {}", id, job_id);
        Ok(job_id)
    }
}

/// Build the job a recurring entry fires.
pub fn recurring_job(entry: &ScheduleEntry) -> Result<JobRecord, JobError> {
    let ScheduleKind::Recurring {
        payload,
        display_name,
        queue,
        retry_policy,
        ..
    } = &entry.kind
    else {
        return Err(JobError::InvalidOperation(format!(
            "schedule entry {} is not recurring",
            entry.id
        )));
    };
    let mut record = JobRecord::new(
        display_name.clone(),
        payload.clone(),
        queue.clone(),
        JobState::Enqueued {
            queue: queue.clone(),
        },
    )
    .with_parameter(RECURRING_JOB_PARAM, json!(entry.id));
    record.retry_policy = retry_policy.clone();
    Ok(record)
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
