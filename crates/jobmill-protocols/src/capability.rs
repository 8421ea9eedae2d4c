//! Handler-facing types: the operation trait and the per-job context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, StorageError};
use crate::job::JobId;

/// Lease renewal hook handed to running jobs.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    /// Extend the lease. `Ok(false)` means the lease was lost.
    async fn beat(&self) -> Result<bool, StorageError>;
}

/// Execution context of a single attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub queue: String,
    pub worker_id: String,
    pub parameters: HashMap<String, Value>,
    pub cancellation: CancellationToken,
    heartbeat: Option<Arc<dyn Heartbeat>>,
}

impl JobContext {
    pub fn new(job_id: JobId, attempt: u32, queue: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            job_id,
            attempt,
            queue: queue.into(),
            worker_id: worker_id.into(),
            parameters: HashMap::new(),
            cancellation: CancellationToken::new(),
            heartbeat: None,
        }
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn Heartbeat>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Return `Cancelled` if the job was asked to stop.
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Extend this job's lease.
    ///
    /// A lost lease cancels the context and yields `LeaseExpired`; the job
    /// should stop, another worker may already own it.
    pub async fn heartbeat(&self) -> Result<(), JobError> {
        let Some(heartbeat) = &self.heartbeat else {
            return Ok(());
        };
        match heartbeat.beat().await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.cancellation.cancel();
                Err(JobError::LeaseExpired)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("queue", &self.queue)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// A registered operation, invoked with the decoded JSON arguments.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn invoke(&self, args: Value, ctx: JobContext) -> Result<Value, JobError>;
}
