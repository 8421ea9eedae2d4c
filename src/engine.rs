//! Engine assembly shared by the `run` command and the one-shot commands.

use std::sync::Arc;

use tracing::{info, warn};

use jobmill_config::{Config, Misfire, RecurringConfig, StorageBackend};
use jobmill_core::{CapabilityRegistry, JobClient, RecurringOptions, StateMachine};
use jobmill_dashboard::Dashboard;
use jobmill_protocols::{Invocation, Storage};
use jobmill_scheduler::{MisfirePolicy, SchedulerConfig};
use jobmill_storage::{MemoryStorage, SqliteStorage};
use jobmill_workqueue::WorkerConfig;

use crate::demo::register_demo_capabilities;

/// Storage, registry and state machine wired from the configuration.
pub(crate) struct Engine {
    pub state: Arc<StateMachine>,
    pub client: JobClient,
}

impl Engine {
    pub(crate) async fn build(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let storage = open_storage(config).await?;

        let registry = Arc::new(CapabilityRegistry::new());
        register_demo_capabilities(&registry)?;
        info!("Registered {} operations", registry.len());

        let state = Arc::new(StateMachine::new(storage, registry, config.retry_policy()));
        let client = JobClient::new(state.clone());
        Ok(Self { state, client })
    }

    pub(crate) fn dashboard(&self) -> Dashboard {
        Dashboard::new(self.client.clone())
    }
}

async fn open_storage(config: &Config) -> Result<Arc<dyn Storage>, Box<dyn std::error::Error>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; jobs are lost when the process exits");
            Ok(Arc::new(MemoryStorage::new()))
        }
        StorageBackend::Sqlite => {
            let path = config.storage.resolved_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!("Opening SQLite storage at {}", path.display());
            Ok(Arc::new(SqliteStorage::open(&path).await?))
        }
    }
}

/// Register the `[[recurring]]` entries of the configuration.
///
/// Upserting keeps each entry's watermark, so restarts do not refire.
pub(crate) async fn register_recurring(
    client: &JobClient,
    entries: &[RecurringConfig],
) -> Result<(), Box<dyn std::error::Error>> {
    for entry in entries {
        let invocation = Invocation::new(&entry.capability, &entry.operation, entry.args.clone());
        let options = RecurringOptions {
            queue: entry.queue.clone(),
            timezone: entry.timezone.clone(),
            ..Default::default()
        };
        let registered = client
            .add_or_update_recurring(&entry.id, &invocation, &entry.cron, options)
            .await?;
        info!(
            "Recurring job {} ({} {}) registered",
            registered.id,
            invocation.display_name(),
            entry.cron
        );
    }
    Ok(())
}

pub(crate) fn worker_config(config: &Config) -> WorkerConfig {
    let worker = &config.worker;
    let mut pool = WorkerConfig::default()
        .with_count(worker.count)
        .with_queues(worker.queues.iter().cloned())
        .with_poll_interval(worker.poll_interval())
        .with_lease(worker.lease())
        .with_heartbeat_interval(worker.heartbeat_interval())
        .with_shutdown_grace(worker.shutdown_grace());
    if let Some(name) = &worker.server_name {
        pool = pool.with_server_name(name.clone());
    }
    pool
}

pub(crate) fn scheduler_config(config: &Config) -> SchedulerConfig {
    let misfire = match config.scheduler.misfire {
        Misfire::Coalesce => MisfirePolicy::Coalesce,
        Misfire::FireAll => MisfirePolicy::FireAll,
    };
    SchedulerConfig::default()
        .with_poll_interval(config.scheduler.poll_interval())
        .with_reap_interval(config.scheduler.reap_interval())
        .with_misfire(misfire)
        .with_failed_retention(config.retention.failed_retention())
}
