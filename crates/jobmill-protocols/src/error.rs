//! Error taxonomy for storage and job execution.

use thiserror::Error;

use crate::job::{FailureKind, StateName};

/// Storage backend errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    /// Backend connectivity lost. Retryable.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A guarded update found the record in an unexpected state.
    #[error("Conflict on {id}: {reason}")]
    Conflict { id: String, reason: String },

    /// The state machine does not allow this transition.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: StateName, to: StateName },

    /// Stored data could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A record with the same identity already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Backend rejected the query.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Check if the error is transient and the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    pub fn conflict(id: impl ToString, reason: impl Into<String>) -> Self {
        StorageError::Conflict {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Engine-level errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    /// Storage is unreachable. Surfaced to callers as transient.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Stored payload no longer matches any known operation signature.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The job's own logic returned an error.
    #[error("Payload error: {0}")]
    Payload(String),

    /// No handler registered for the target.
    #[error("Unknown capability: {capability}.{operation}")]
    UnknownCapability { capability: String, operation: String },

    /// The worker lost its lease before finishing.
    #[error("Lease expired")]
    LeaseExpired,

    /// The job observed its cancellation signal and stopped.
    #[error("Job cancelled")]
    Cancelled,

    /// Job or schedule entry not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested action is not valid for the job's current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Cron expression or timezone could not be parsed.
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    /// Capability operation registered twice.
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// Other storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl JobError {
    /// Build a payload error from any displayable error.
    pub fn payload(err: impl std::fmt::Display) -> Self {
        JobError::Payload(err.to_string())
    }

    /// Check if the error is transient (storage connectivity).
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::StorageUnavailable(_))
    }

    /// Classify an execution error for the job's failure record.
    ///
    /// Returns `None` for errors that are not job outcomes.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            JobError::Payload(_) => Some(FailureKind::Payload),
            JobError::Deserialization(_) => Some(FailureKind::Deserialization),
            JobError::UnknownCapability { .. } => Some(FailureKind::UnknownCapability),
            JobError::LeaseExpired => Some(FailureKind::LeaseExpired),
            JobError::Cancelled => Some(FailureKind::Cancelled),
            _ => None,
        }
    }

    /// Message recorded in the job's history, if any.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            JobError::Payload(m) | JobError::Deserialization(m) => Some(m.clone()),
            JobError::UnknownCapability { .. } => Some(self.to_string()),
            JobError::LeaseExpired | JobError::Cancelled => None,
            other => Some(other.to_string()),
        }
    }
}

impl From<StorageError> for JobError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(m) => JobError::StorageUnavailable(m),
            StorageError::NotFound(m) => JobError::NotFound(m),
            StorageError::Conflict { .. } | StorageError::InvalidTransition { .. } => {
                JobError::InvalidOperation(err.to_string())
            }
            other => JobError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_unavailable_is_transient() {
        assert!(StorageError::Unavailable("down".to_string()).is_transient());
        assert!(!StorageError::NotFound("x".to_string()).is_transient());
    }

    #[test]
    fn test_storage_error_maps_to_job_error() {
        let err: JobError = StorageError::Unavailable("socket closed".to_string()).into();
        assert!(err.is_transient());

        let err: JobError = StorageError::NotFound("job 1".to_string()).into();
        assert!(matches!(err, JobError::NotFound(_)));

        let err: JobError = StorageError::InvalidTransition {
            from: StateName::Succeeded,
            to: StateName::Enqueued,
        }
        .into();
        assert!(matches!(err, JobError::InvalidOperation(_)));
    }

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(JobError::payload("boom").failure_kind(), Some(FailureKind::Payload));
        assert_eq!(JobError::LeaseExpired.failure_kind(), Some(FailureKind::LeaseExpired));
        assert_eq!(JobError::LeaseExpired.failure_message(), None);
        assert_eq!(
            JobError::UnknownCapability {
                capability: "mail".to_string(),
                operation: "send".to_string()
            }
            .failure_kind(),
            Some(FailureKind::UnknownCapability)
        );
        assert_eq!(JobError::NotFound("x".to_string()).failure_kind(), None);
    }

    #[test]
    fn test_error_display() {
        let err = JobError::UnknownCapability {
            capability: "mail".to_string(),
            operation: "send".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown capability: mail.send");
    }
}
