//! Job records, lifecycle states and the transition table.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::invocation::Payload;
use crate::retry::RetryPolicy;

/// Globally unique, immutable job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// State discriminant, used for indexes and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateName {
    Scheduled,
    Awaiting,
    Enqueued,
    Processing,
    Succeeded,
    Failed,
    Deleted,
}

impl StateName {
    /// All states, in lifecycle order.
    pub const ALL: [StateName; 7] = [
        StateName::Scheduled,
        StateName::Awaiting,
        StateName::Enqueued,
        StateName::Processing,
        StateName::Succeeded,
        StateName::Failed,
        StateName::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateName::Scheduled => "scheduled",
            StateName::Awaiting => "awaiting",
            StateName::Enqueued => "enqueued",
            StateName::Processing => "processing",
            StateName::Succeeded => "succeeded",
            StateName::Failed => "failed",
            StateName::Deleted => "deleted",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StateName::Succeeded | StateName::Deleted)
    }

    /// Transition table of the job lifecycle.
    pub fn can_transition_to(&self, next: StateName) -> bool {
        use StateName::*;
        matches!(
            (self, next),
            (Scheduled, Enqueued)
                | (Scheduled, Deleted)
                | (Awaiting, Enqueued)
                | (Awaiting, Deleted)
                | (Enqueued, Processing)
                | (Enqueued, Deleted)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Processing, Deleted)
                | (Failed, Enqueued)
                | (Failed, Deleted)
        )
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StateName::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state: {}", s))
    }
}

/// Why a job attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The payload returned an error.
    Payload,
    /// Stored bytes no longer decode.
    Deserialization,
    /// No handler registered for the target.
    UnknownCapability,
    /// The worker's lease ran out before it reported.
    LeaseExpired,
    /// The payload stopped on a cancellation signal.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Payload => "payload",
            FailureKind::Deserialization => "deserialization",
            FailureKind::UnknownCapability => "unknown_capability",
            FailureKind::LeaseExpired => "lease_expired",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Whether failures of this kind go through the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Payload | FailureKind::LeaseExpired | FailureKind::Cancelled
        )
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its run-at time.
    Scheduled { enqueue_at: DateTime<Utc> },
    /// Continuation waiting for its parent to succeed.
    Awaiting { parent: JobId },
    /// Ready to be leased from a queue.
    Enqueued { queue: String },
    /// Leased by a worker.
    Processing {
        worker_id: String,
        lease_expires_at: DateTime<Utc>,
        attempt: u32,
    },
    /// Finished without error.
    Succeeded {
        result: serde_json::Value,
        duration_ms: u64,
    },
    /// Attempt failed; `retry_at` is set while a retry is pending.
    Failed {
        kind: FailureKind,
        message: Option<String>,
        attempt: u32,
        retry_at: Option<DateTime<Utc>>,
    },
    /// Removed by an operator or by policy.
    Deleted { reason: Option<String> },
}

impl JobState {
    pub fn name(&self) -> StateName {
        match self {
            JobState::Scheduled { .. } => StateName::Scheduled,
            JobState::Awaiting { .. } => StateName::Awaiting,
            JobState::Enqueued { .. } => StateName::Enqueued,
            JobState::Processing { .. } => StateName::Processing,
            JobState::Succeeded { .. } => StateName::Succeeded,
            JobState::Failed { .. } => StateName::Failed,
            JobState::Deleted { .. } => StateName::Deleted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.name().is_terminal()
    }

    /// Worker holding the lease, if processing.
    pub fn lease_holder(&self) -> Option<&str> {
        match self {
            JobState::Processing { worker_id, .. } => Some(worker_id),
            _ => None,
        }
    }

    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Processing {
                lease_expires_at, ..
            } => Some(*lease_expires_at),
            _ => None,
        }
    }

    /// Pending retry time of a failed job.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Failed { retry_at, .. } => *retry_at,
            _ => None,
        }
    }

    /// Failed with no pending retry.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, JobState::Failed { retry_at: None, .. })
    }
}

/// One entry of a job's append-only state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    #[serde(flatten)]
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// `capability.operation`, for display.
    pub display_name: String,
    /// Encoded invocation.
    pub payload: Payload,
    pub queue: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: JobState,
    pub history: Vec<StateHistoryEntry>,
    /// Number of leases taken so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<JobId>,
    /// Children to enqueue once this job succeeds.
    #[serde(default)]
    pub continuations: Vec<JobId>,
}

impl JobRecord {
    /// Create a record in its initial state.
    pub fn new(
        display_name: impl Into<String>,
        payload: Payload,
        queue: impl Into<String>,
        state: JobState,
    ) -> Self {
        let now = Utc::now();
        let parent = match &state {
            JobState::Awaiting { parent } => Some(*parent),
            _ => None,
        };
        Self {
            id: JobId::new(),
            display_name: display_name.into(),
            payload,
            queue: queue.into(),
            created_at: now,
            updated_at: now,
            history: vec![StateHistoryEntry {
                state: state.clone(),
                reason: None,
                recorded_at: now,
            }],
            state,
            attempts: 0,
            retry_policy: None,
            parameters: HashMap::new(),
            parent,
            continuations: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn state_name(&self) -> StateName {
        self.state.name()
    }

    /// Apply a transition, appending to the history.
    ///
    /// Fails without modifying the record if the lifecycle forbids it.
    pub fn apply(
        &mut self,
        state: JobState,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let from = self.state.name();
        let to = state.name();
        if !from.can_transition_to(to) {
            return Err(StorageError::InvalidTransition { from, to });
        }

        if let JobState::Processing { attempt, .. } = &state {
            self.attempts = *attempt;
        }
        if let JobState::Enqueued { queue } = &state {
            self.queue = queue.clone();
        }

        self.history.push(StateHistoryEntry {
            state: state.clone(),
            reason,
            recorded_at: at,
        });
        self.state = state;
        self.updated_at = at;
        Ok(())
    }

    /// Most recent failure message, if any.
    pub fn last_error(&self) -> Option<String> {
        self.history.iter().rev().find_map(|entry| match &entry.state {
            JobState::Failed { kind, message, .. } => {
                Some(message.clone().unwrap_or_else(|| kind.as_str().to_string()))
            }
            _ => None,
        })
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            display_name: self.display_name.clone(),
            queue: self.queue.clone(),
            state: self.state_name(),
            attempts: self.attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_error: self.last_error(),
        }
    }
}

/// Compact listing row for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub display_name: String,
    pub queue: String,
    pub state: StateName,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
