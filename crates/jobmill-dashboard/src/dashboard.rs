//! Query and operator-action contract over storage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use jobmill_core::{EnqueueOptions, JobClient};
use jobmill_protocols::{
    Invocation, JobError, JobId, JobRecord, JobSummary, Page, QueueInfo, ScheduleKind,
    StateCounts, StateName, Storage,
};

/// Overview counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    /// Every state, including those with no jobs.
    pub states: StateCounts,
    pub total: u64,
    pub queues: Vec<QueueInfo>,
    pub recurring: usize,
}

/// One page of a job listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPage {
    pub page: u32,
    pub per_page: u32,
    /// Jobs matching the filter across all pages.
    pub total: u64,
    pub jobs: Vec<JobSummary>,
}

/// Listing row for a recurring entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecurringSummary {
    pub id: String,
    pub cron: String,
    pub timezone: String,
    pub display_name: String,
    pub queue: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fired: Option<DateTime<Utc>>,
    pub last_job_id: Option<JobId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Job submission from outside the process.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub capability: String,
    pub operation: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub queue: Option<String>,
    /// Run once after this many seconds instead of right away.
    #[serde(default)]
    pub delay_secs: Option<u64>,
    /// Run after this job succeeds.
    #[serde(default)]
    pub after: Option<JobId>,
}

pub struct Dashboard {
    client: JobClient,
}

impl Dashboard {
    pub fn new(client: JobClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &JobClient {
        &self.client
    }

    fn storage(&self) -> &dyn Storage {
        self.client.state_machine().storage().as_ref()
    }

    pub async fn stats(&self) -> Result<DashboardStats, JobError> {
        let mut states: StateCounts = StateName::ALL.into_iter().map(|s| (s, 0)).collect();
        states.extend(self.storage().count_by_state(None).await?);
        Ok(DashboardStats {
            total: states.values().sum(),
            states,
            queues: self.storage().list_queues().await?,
            recurring: self.storage().list_schedules(true).await?.len(),
        })
    }

    /// Jobs newest-updated first, optionally filtered by state and queue.
    pub async fn list_jobs(
        &self,
        state: Option<StateName>,
        queue: Option<&str>,
        page: Page,
    ) -> Result<JobPage, JobError> {
        let records = self.storage().list_by_state(state, queue, page).await?;
        let counts = self.storage().count_by_state(queue).await?;
        let total = match state {
            Some(state) => counts.get(&state).copied().unwrap_or(0),
            None => counts.values().sum(),
        };
        Ok(JobPage {
            page: page.number,
            per_page: page.per_page,
            total,
            jobs: records.iter().map(JobRecord::summary).collect(),
        })
    }

    /// Full record, including its state history.
    pub async fn get_job(&self, id: &JobId) -> Result<JobRecord, JobError> {
        Ok(self.storage().get(id).await?)
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueInfo>, JobError> {
        Ok(self.storage().list_queues().await?)
    }

    pub async fn list_recurring(&self) -> Result<Vec<RecurringSummary>, JobError> {
        let entries = self.storage().list_schedules(true).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry.kind {
                ScheduleKind::Recurring {
                    cron,
                    timezone,
                    display_name,
                    queue,
                    last_fired,
                    last_job_id,
                    last_error,
                    ..
                } => Some(RecurringSummary {
                    id: entry.id,
                    cron,
                    timezone,
                    display_name,
                    queue,
                    next_fire: entry.next_fire,
                    last_fired,
                    last_job_id,
                    last_error,
                    created_at: entry.created_at,
                }),
                ScheduleKind::RunAt { .. } => None,
            })
            .collect())
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId, JobError> {
        let invocation = Invocation::new(request.capability, request.operation, request.args);
        let options = EnqueueOptions {
            queue: request.queue,
            ..Default::default()
        };
        match (request.after, request.delay_secs) {
            (Some(parent), _) => self.client.continue_with(&parent, &invocation, options).await,
            (None, Some(secs)) => {
                self.client
                    .schedule(&invocation, Duration::from_secs(secs), options)
                    .await
            }
            (None, None) => self.client.enqueue_invocation(&invocation, options).await,
        }
    }

    /// Re-enqueue a failed or scheduled job.
    pub async fn requeue(&self, id: &JobId) -> Result<JobRecord, JobError> {
        info!("Operator requeue of job {}", id);
        self.client.state_machine().requeue(id).await
    }

    pub async fn delete(&self, id: &JobId) -> Result<JobRecord, JobError> {
        info!("Operator delete of job {}", id);
        self.client.state_machine().delete(id, "deleted by operator").await
    }

    pub async fn trigger_recurring(&self, id: &str) -> Result<JobId, JobError> {
        info!("Operator trigger of recurring job {}", id);
        self.client.trigger_recurring(id).await
    }

    pub async fn remove_recurring(&self, id: &str) -> Result<(), JobError> {
        if self.client.remove_recurring(id).await? {
            Ok(())
        } else {
            Err(JobError::NotFound(format!("recurring job {}", id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobmill_core::{CapabilityRegistry, RecurringOptions, StateMachine};
    use jobmill_protocols::RetryPolicy;
    use jobmill_storage::MemoryStorage;
    use serde_json::json;

    fn dashboard() -> Dashboard {
        let state = StateMachine::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(CapabilityRegistry::new()),
            RetryPolicy::default(),
        );
        Dashboard::new(JobClient::new(Arc::new(state)))
    }

    #[tokio::test]
    async fn test_stats_include_empty_states() {
        let dashboard = dashboard();
        dashboard.client().enqueue("echo", "echo", json!({})).await.unwrap();

        let stats = dashboard.stats().await.unwrap();
        assert_eq!(stats.states.len(), StateName::ALL.len());
        assert_eq!(stats.states[&StateName::Enqueued], 1);
        assert_eq!(stats.states[&StateName::Failed], 0);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.queues[0].enqueued, 1);
        assert_eq!(stats.recurring, 0);
    }

    #[tokio::test]
    async fn test_list_jobs_pages_and_totals() {
        let dashboard = dashboard();
        for n in 0..5 {
            dashboard
                .client()
                .enqueue("echo", "echo", json!({ "n": n }))
                .await
                .unwrap();
        }

        let page = dashboard
            .list_jobs(Some(StateName::Enqueued), None, Page::new(2, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 2);

        let last = dashboard.list_jobs(None, None, Page::new(3, 2)).await.unwrap();
        assert_eq!(last.jobs.len(), 1);

        let none = dashboard
            .list_jobs(Some(StateName::Failed), None, Page::default())
            .await
            .unwrap();
        assert_eq!(none.total, 0);
        assert!(none.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_submit_variants() {
        let dashboard = dashboard();
        let request = |delay_secs, after| SubmitRequest {
            capability: "echo".to_string(),
            operation: "echo".to_string(),
            args: json!({ "message": "hi" }),
            queue: None,
            delay_secs,
            after,
        };

        let now = dashboard.submit(request(None, None)).await.unwrap();
        let later = dashboard.submit(request(Some(60), None)).await.unwrap();
        let child = dashboard.submit(request(None, Some(now))).await.unwrap();

        for (id, expected) in [
            (now, StateName::Enqueued),
            (later, StateName::Scheduled),
            (child, StateName::Awaiting),
        ] {
            assert_eq!(dashboard.get_job(&id).await.unwrap().state_name(), expected);
        }
    }

    #[tokio::test]
    async fn test_operator_actions() {
        let dashboard = dashboard();
        let id = dashboard
            .client()
            .schedule(
                &Invocation::new("echo", "echo", json!({})),
                Duration::from_secs(3600),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let requeued = dashboard.requeue(&id).await.unwrap();
        assert_eq!(requeued.state_name(), StateName::Enqueued);
        assert!(matches!(
            dashboard.requeue(&id).await,
            Err(JobError::InvalidOperation(_))
        ));

        let deleted = dashboard.delete(&id).await.unwrap();
        assert_eq!(deleted.state_name(), StateName::Deleted);
        assert!(matches!(
            dashboard.get_job(&JobId::new()).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recurring_listing_and_actions() {
        let dashboard = dashboard();
        dashboard
            .client()
            .add_or_update_recurring(
                "nightly",
                &Invocation::new("echo", "echo", json!({})),
                "0 3 * * *",
                RecurringOptions::default(),
            )
            .await
            .unwrap();

        let listed = dashboard.list_recurring().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "nightly");
        assert_eq!(listed[0].display_name, "echo.echo");
        assert!(listed[0].next_fire.is_some());

        let job = dashboard.trigger_recurring("nightly").await.unwrap();
        assert_eq!(dashboard.get_job(&job).await.unwrap().state_name(), StateName::Enqueued);

        dashboard.remove_recurring("nightly").await.unwrap();
        assert!(dashboard.list_recurring().await.unwrap().is_empty());
        assert!(matches!(
            dashboard.remove_recurring("nightly").await,
            Err(JobError::NotFound(_))
        ));
    }
}
