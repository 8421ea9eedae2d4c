//! Lease renewal for running jobs.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use jobmill_core::JobQueue;
use jobmill_protocols::{Heartbeat, JobError, JobId, StorageError};

/// Renews one job's lease on behalf of the worker holding it.
pub struct LeaseHeartbeat {
    queue: JobQueue,
    job_id: JobId,
    worker_id: String,
    lease: Duration,
}

impl LeaseHeartbeat {
    pub fn new(queue: JobQueue, job_id: JobId, worker_id: impl Into<String>, lease: Duration) -> Self {
        Self {
            queue,
            job_id,
            worker_id: worker_id.into(),
            lease,
        }
    }
}

#[async_trait]
impl Heartbeat for LeaseHeartbeat {
    async fn beat(&self) -> Result<bool, StorageError> {
        match self.queue.renew(&self.job_id, &self.worker_id, self.lease).await {
            Ok(held) => {
                debug!("Lease of job {} renewed by {}: {}", self.job_id, self.worker_id, held);
                Ok(held)
            }
            Err(JobError::StorageUnavailable(m)) => Err(StorageError::Unavailable(m)),
            Err(JobError::NotFound(m)) => Err(StorageError::NotFound(m)),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobmill_protocols::Invocation;
    use jobmill_storage::MemoryStorage;
    use serde_json::json;

    #[tokio::test]
    async fn test_beat_tracks_lease_ownership() {
        let queue = JobQueue::new(Arc::new(MemoryStorage::new()));
        let id = queue
            .enqueue(&Invocation::new("echo", "echo", json!({})), "default")
            .await
            .unwrap();
        queue
            .lease("default", "w:0", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let holder = LeaseHeartbeat::new(queue.clone(), id, "w:0", Duration::from_secs(30));
        assert!(holder.beat().await.unwrap());

        let stranger = LeaseHeartbeat::new(queue, id, "w:1", Duration::from_secs(30));
        assert!(!stranger.beat().await.unwrap());
    }
}
