//! Schedule entries: delayed jobs and recurring definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::invocation::Payload;
use crate::job::JobId;
use crate::retry::RetryPolicy;

/// What a schedule entry produces when due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Promote an existing job once `run_at` passes.
    RunAt {
        job_id: JobId,
        run_at: DateTime<Utc>,
    },
    /// Create a new job at each cron boundary.
    Recurring {
        cron: String,
        #[serde(default = "default_timezone")]
        timezone: String,
        payload: Payload,
        display_name: String,
        queue: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_policy: Option<RetryPolicy>,
        #[serde(default)]
        last_fired: Option<DateTime<Utc>>,
        #[serde(default)]
        last_job_id: Option<JobId>,
        #[serde(default)]
        last_error: Option<String>,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// A persisted schedule entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Job id for delayed jobs, caller-chosen id for recurring ones.
    pub id: String,
    #[serde(flatten)]
    pub kind: ScheduleKind,
    /// `None` when the expression has no future occurrence.
    pub next_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleEntry {
    /// Entry that promotes `job_id` at `run_at`.
    pub fn run_at(job_id: JobId, run_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: job_id.to_string(),
            kind: ScheduleKind::RunAt { job_id, run_at },
            next_fire: Some(run_at),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.kind, ScheduleKind::Recurring { .. })
    }

    /// Carry over runtime fields from the stored version of this entry.
    ///
    /// Firing history always survives. The stored `next_fire` is kept only
    /// when the cron expression and timezone are unchanged.
    pub fn merge_existing(&mut self, existing: &ScheduleEntry) {
        self.created_at = existing.created_at;
        let (
            ScheduleKind::Recurring {
                cron,
                timezone,
                last_fired,
                last_job_id,
                last_error,
                ..
            },
            ScheduleKind::Recurring {
                cron: old_cron,
                timezone: old_timezone,
                last_fired: old_fired,
                last_job_id: old_job,
                last_error: old_error,
                ..
            },
        ) = (&mut self.kind, &existing.kind)
        else {
            return;
        };

        *last_fired = *old_fired;
        *last_job_id = *old_job;
        *last_error = old_error.clone();
        if *cron == *old_cron && *timezone == *old_timezone {
            self.next_fire = existing.next_fire;
        }
    }

    /// Resolve a recurring upsert against the stored entry with the same id.
    pub fn merged_with(mut self, existing: Option<&ScheduleEntry>) -> Result<Self, StorageError> {
        if !self.is_recurring() {
            return Err(StorageError::conflict(&self.id, "not a recurring entry"));
        }
        if let Some(existing) = existing {
            if !existing.is_recurring() {
                return Err(StorageError::conflict(
                    &self.id,
                    "schedule entry is not recurring",
                ));
            }
            self.merge_existing(existing);
        }
        Ok(self)
    }
}

/// Outcome of one recurring fire, applied with a compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringFire {
    pub fired_at: DateTime<Utc>,
    pub next_fire: Option<DateTime<Utc>>,
    pub job_id: Option<JobId>,
    pub error: Option<String>,
}
