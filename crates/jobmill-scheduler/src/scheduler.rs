//! Scheduler loop: promotes due entries, fires cron boundaries, reaps leases.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobmill_core::client::recurring_job;
use jobmill_core::{CronExpr, StateMachine, TransientRetry};
use jobmill_protocols::{
    JobError, JobId, JobRecord, RecurringFire, ScheduleEntry, ScheduleKind, Storage,
};

use crate::config::{MisfirePolicy, SchedulerConfig};

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Delayed jobs and retries moved into their queue.
    pub promoted: usize,
    /// Jobs created from recurring entries.
    pub fired: usize,
    /// Expired leases sent back through the retry path.
    pub reaped: usize,
    /// Exhausted failures deleted by retention.
    pub swept: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        *self == TickReport::default()
    }
}

pub struct Scheduler {
    state: Arc<StateMachine>,
    storage: Arc<dyn Storage>,
    config: SchedulerConfig,
    transient: TransientRetry,
}

impl Scheduler {
    pub fn new(state: Arc<StateMachine>, config: SchedulerConfig) -> Self {
        Self {
            storage: state.storage().clone(),
            state,
            config,
            transient: TransientRetry::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Scheduler started (poll interval: {:?}, reap interval: {:?}, misfire: {:?})",
            self.config.poll_interval, self.config.reap_interval, self.config.misfire
        );

        let mut poll = time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reap = time::interval(self.config.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = poll.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if !report.is_empty() => debug!("Scheduler tick: {:?}", report),
                        Ok(_) => {}
                        Err(e) => error!("Scheduler tick failed: {}", e),
                    }
                }
                _ = reap.tick() => {
                    match self.maintain(Utc::now()).await {
                        Ok(report) if !report.is_empty() => debug!("Scheduler maintenance: {:?}", report),
                        Ok(_) => {}
                        Err(e) => error!("Scheduler maintenance failed: {}", e),
                    }
                }
            }
        }
    }

    /// Handle every schedule entry due at `now`.
    ///
    /// A failing entry is logged and skipped; only a storage outage aborts
    /// the pass.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, JobError> {
        let mut report = TickReport::default();
        let due = self
            .storage
            .due_schedules(now, self.config.batch_size)
            .await?;

        for entry in due {
            let result = match &entry.kind {
                ScheduleKind::RunAt { job_id, .. } => self
                    .promote_due(&entry, job_id)
                    .await
                    .map(usize::from),
                ScheduleKind::Recurring { .. } => self.fire_recurring(&entry, now).await,
            };
            match (&entry.kind, result) {
                (ScheduleKind::RunAt { .. }, Ok(n)) => report.promoted += n,
                (ScheduleKind::Recurring { .. }, Ok(n)) => report.fired += n,
                (_, Err(e)) if e.is_transient() => return Err(e),
                (_, Err(e)) => warn!("Schedule entry {} failed: {}", entry.id, e),
            }
        }
        Ok(report)
    }

    /// Reap expired leases and apply the retention window.
    pub async fn maintain(&self, now: DateTime<Utc>) -> Result<TickReport, JobError> {
        let mut report = TickReport {
            reaped: self
                .state
                .recover_expired_leases(now, self.config.batch_size)
                .await?,
            ..Default::default()
        };
        if let Some(retention) = self.config.failed_retention {
            let cutoff = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|retention| now.checked_sub_signed(retention))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            report.swept = self
                .state
                .sweep_exhausted(cutoff, self.config.batch_size)
                .await?;
        }
        if report.reaped > 0 || report.swept > 0 {
            info!(
                "Recovered {} expired leases, deleted {} exhausted jobs",
                report.reaped, report.swept
            );
        }
        Ok(report)
    }

    /// Drop the entry, then promote its job. A new retry entry for the same
    /// job can only appear after the promotion, so it is never dropped here.
    async fn promote_due(&self, entry: &ScheduleEntry, job_id: &JobId) -> Result<bool, JobError> {
        self.storage.remove_schedule(&entry.id).await?;
        match self.state.promote(job_id).await {
            Ok(promoted) => {
                if !promoted {
                    debug!("Job {} no longer waiting on its schedule entry", job_id);
                }
                Ok(promoted)
            }
            Err(e) => {
                if let Err(restore) = self.storage.upsert_schedule(entry.clone()).await {
                    error!("Could not restore schedule entry {}: {}", entry.id, restore);
                }
                Err(e)
            }
        }
    }

    /// Fire the boundaries of a recurring entry that passed by `now`.
    ///
    /// The watermark moves first with a compare-and-set on `next_fire`; only
    /// the caller that wins it creates jobs.
    async fn fire_recurring(
        &self,
        entry: &ScheduleEntry,
        now: DateTime<Utc>,
    ) -> Result<usize, JobError> {
        let ScheduleKind::Recurring { cron, timezone, .. } = &entry.kind else {
            return Ok(0);
        };
        let Some(due) = entry.next_fire else {
            return Ok(0);
        };

        let expr = match CronExpr::parse(cron, timezone) {
            Ok(expr) => expr,
            Err(e) => {
                warn!("Recurring job {} disabled: {}", entry.id, e);
                let fire = RecurringFire {
                    fired_at: now,
                    next_fire: None,
                    job_id: None,
                    error: Some(e.to_string()),
                };
                self.storage
                    .advance_recurring(&entry.id, Some(due), fire)
                    .await?;
                return Ok(0);
            }
        };

        let mut boundaries = vec![due];
        boundaries.extend(expr.occurrences_between(due, now, self.config.max_catch_up));
        if self.config.misfire == MisfirePolicy::Coalesce && boundaries.len() > 1 {
            debug!(
                "Recurring job {} missed {} boundaries, coalescing",
                entry.id,
                boundaries.len() - 1
            );
            boundaries.drain(..boundaries.len() - 1);
        }

        let jobs = boundaries
            .iter()
            .map(|_| recurring_job(entry))
            .collect::<Result<Vec<JobRecord>, JobError>>()?;
        let fired_at = boundaries.last().copied().unwrap_or(due);
        let fire = RecurringFire {
            fired_at,
            next_fire: expr.next_after(now),
            job_id: jobs.last().map(|job| job.id),
            error: None,
        };
        let next_fire = fire.next_fire;
        if !self
            .storage
            .advance_recurring(&entry.id, Some(due), fire)
            .await?
        {
            debug!("Recurring job {} already fired for {}", entry.id, due);
            return Ok(0);
        }

        let mut fired = 0;
        for (job, boundary) in jobs.into_iter().zip(boundaries) {
            let storage = self.storage.clone();
            let job_id = self
                .transient
                .run("enqueue recurring job", || {
                    let storage = storage.clone();
                    let job = job.clone();
                    async move { storage.put(job).await.map_err(JobError::from) }
                })
                .await?;
            info!(
                "Recurring job {} fired for {} as job {}",
                entry.id, boundary, job_id
            );
            fired += 1;
        }
        debug!("Recurring job {} next fire {:?}", entry.id, next_fire);
        Ok(fired)
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
