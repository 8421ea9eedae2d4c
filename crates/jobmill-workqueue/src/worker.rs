//! Worker pool for job execution.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use jobmill_core::{FailureOutcome, LeaseGuard, StateMachine, TransientRetry, serializer};
use jobmill_protocols::{Heartbeat, JobContext, JobError, JobId, JobRecord};

use crate::config::WorkerConfig;
use crate::heartbeat::LeaseHeartbeat;

/// Result of processing one leased job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded { id: JobId, duration: Duration },
    Failed { id: JobId, outcome: FailureOutcome },
    /// The outcome could not be recorded; the lease was lost or storage
    /// stayed down. The reaper returns the job once its lease expires.
    Abandoned { id: JobId },
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    busy: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub busy: usize,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            processed: self.processed.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            busy: self.busy.load(Ordering::SeqCst),
        }
    }

    fn record(&self, outcome: &JobOutcome) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        match outcome {
            JobOutcome::Succeeded { .. } => self.succeeded.fetch_add(1, Ordering::SeqCst),
            _ => self.failed.fetch_add(1, Ordering::SeqCst),
        };
    }
}

/// Worker pool for concurrent job execution.
///
/// Slots coordinate only through storage leases; nothing here prevents two
/// pools, in one process or many, from serving the same queues.
pub struct WorkerPool {
    state: Arc<StateMachine>,
    config: WorkerConfig,
    stats: PoolStats,
    /// Parent of every running job's cancellation token.
    jobs: CancellationToken,
    transient: TransientRetry,
}

impl WorkerPool {
    pub fn new(state: Arc<StateMachine>, config: WorkerConfig) -> Self {
        Self {
            state,
            config,
            stats: PoolStats::default(),
            jobs: CancellationToken::new(),
            transient: TransientRetry::default(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run every slot until `shutdown` fires, then cancel running jobs and
    /// wait for them up to the shutdown grace period.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Worker pool started with {} workers on {:?} (lease {:?})",
            self.config.count, self.config.queues, self.config.lease
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.config.count {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            slots.spawn(async move { pool.slot_loop(slot, shutdown).await });
        }

        shutdown.cancelled().await;
        info!(
            "Worker pool stopping, waiting up to {:?} for {} running jobs",
            self.config.shutdown_grace,
            self.stats.snapshot().busy
        );
        self.jobs.cancel();

        let drain = async { while slots.join_next().await.is_some() {} };
        if time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!("Worker pool grace period elapsed; abandoning running jobs to lease expiry");
            slots.abort_all();
            while slots.join_next().await.is_some() {}
        }
        info!("Worker pool stopped: {:?}", self.stats.snapshot());
    }

    async fn slot_loop(&self, slot: usize, shutdown: CancellationToken) {
        let worker_id = self.config.worker_id(slot);
        debug!("Worker {} started", worker_id);
        let mut outage = 0u32;

        while !shutdown.is_cancelled() {
            let pause = match self.process_next(&worker_id).await {
                Ok(Some(_)) => {
                    outage = 0;
                    continue;
                }
                Ok(None) => {
                    outage = 0;
                    self.config.poll_interval
                }
                Err(e) if e.is_transient() => {
                    let delay = self.transient.delay_for_attempt(outage);
                    outage = outage.saturating_add(1);
                    warn!("Worker {} cannot reach storage: {}, backing off {:?}", worker_id, e, delay);
                    delay
                }
                Err(e) => {
                    error!("Worker {} poll failed: {}", worker_id, e);
                    self.config.poll_interval
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = time::sleep(pause) => {}
            }
        }
        debug!("Worker {} stopped", worker_id);
    }

    /// Lease the next job from the configured queues, in order, and run it.
    ///
    /// Returns `None` when every queue is empty.
    pub async fn process_next(&self, worker_id: &str) -> Result<Option<JobOutcome>, JobError> {
        for queue in &self.config.queues {
            let leased = self
                .state
                .queue()
                .lease(queue, worker_id, self.config.lease)
                .await?;
            if let Some(job) = leased {
                return Ok(Some(self.execute(job, worker_id).await));
            }
        }
        Ok(None)
    }

    async fn execute(&self, job: JobRecord, worker_id: &str) -> JobOutcome {
        self.stats.busy.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Worker {} processing job {} ({}), attempt {}",
            worker_id, job.id, job.display_name, job.attempts
        );

        let started = Instant::now();
        let result = self.invoke(&job, worker_id).await;
        let outcome = self.report(&job, worker_id, result, started.elapsed()).await;

        self.stats.record(&outcome);
        self.stats.busy.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    /// Decode, resolve and run the job, renewing its lease while it runs.
    async fn invoke(&self, job: &JobRecord, worker_id: &str) -> Result<Value, JobError> {
        let invocation = serializer::decode(&job.payload)?;
        let registration = self
            .state
            .registry()
            .resolve(&invocation.capability, &invocation.operation)?;

        let token = self.jobs.child_token();
        let heartbeat = Arc::new(LeaseHeartbeat::new(
            self.state.queue().clone(),
            job.id,
            worker_id,
            self.config.lease,
        ));
        let ctx = JobContext::new(job.id, job.attempts, job.queue.clone(), worker_id)
            .with_parameters(job.parameters.clone())
            .with_cancellation(token.clone())
            .with_heartbeat(heartbeat.clone());

        let handler = registration.handler.clone();
        let args = invocation.args;
        // Aborted with the slot if the pool gives up on it.
        let mut task =
            AbortOnDropHandle::new(tokio::spawn(async move { handler.invoke(args, ctx).await }));

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut beat = time::interval_at(time::Instant::now() + period, period);
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lease_held = true;

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => Err(JobError::Payload(format!(
                            "job panicked: {}",
                            panic_message(e.into_panic())
                        ))),
                        Err(_) => Err(JobError::Cancelled),
                    };
                }
                _ = beat.tick(), if lease_held => {
                    match heartbeat.beat().await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("Worker {} lost the lease of job {}, cancelling it", worker_id, job.id);
                            token.cancel();
                            lease_held = false;
                        }
                        Err(e) => warn!("Lease renewal of job {} failed: {}", job.id, e),
                    }
                }
            }
        }
    }

    /// Hand the attempt's result to the state machine.
    async fn report(
        &self,
        job: &JobRecord,
        worker_id: &str,
        result: Result<Value, JobError>,
        duration: Duration,
    ) -> JobOutcome {
        let state = &self.state;
        let id = job.id;
        match result {
            Ok(value) => {
                let recorded = self
                    .transient
                    .run("record job success", move || {
                        let value = value.clone();
                        async move { state.succeed(&id, worker_id, value, duration).await }
                    })
                    .await;
                match recorded {
                    Ok(_) => {
                        info!("Job {} ({}) succeeded in {:?}", id, job.display_name, duration);
                        JobOutcome::Succeeded { id, duration }
                    }
                    Err(e) => {
                        warn!("Could not record success of job {}: {}", id, e);
                        JobOutcome::Abandoned { id }
                    }
                }
            }
            Err(error) => {
                let guard = LeaseGuard::holder(worker_id);
                let guard = &guard;
                let failure = &error;
                let recorded = self
                    .transient
                    .run("record job failure", move || async move {
                        state.fail(&id, guard, failure).await
                    })
                    .await;
                match recorded {
                    Ok(outcome) => JobOutcome::Failed { id, outcome },
                    Err(e) => {
                        warn!("Could not record failure of job {} ({}): {}", id, error, e);
                        JobOutcome::Abandoned { id }
                    }
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
