//! Engine end to end: client, SQLite storage, worker pools, scheduler and
//! dashboard wired together the way the binary wires them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use jobmill_core::{CapabilityRegistry, EnqueueOptions, JobClient, RecurringOptions, StateMachine};
use jobmill_dashboard::Dashboard;
use jobmill_protocols::{
    Backoff, Invocation, JobContext, JobError, JobId, JobRecord, JobState, RetryPolicy, StateName,
    Storage,
};
use jobmill_scheduler::{Scheduler, SchedulerConfig};
use jobmill_storage::SqliteStorage;
use jobmill_workqueue::{WorkerConfig, WorkerPool};

#[derive(Deserialize)]
struct Message {
    message: String,
}

type Seen = Arc<Mutex<Vec<JobId>>>;

struct Engine {
    _dir: TempDir,
    state: Arc<StateMachine>,
    client: JobClient,
    dashboard: Dashboard,
    seen: Seen,
    shutdown: CancellationToken,
}

impl Engine {
    async fn start(pools: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(SqliteStorage::open(dir.path().join("jobmill.db")).await.unwrap());

        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(CapabilityRegistry::new());
        registry
            .register("echo", "echo", |args: Message, _ctx: JobContext| async move {
                Ok::<_, JobError>(args.message)
            })
            .unwrap();
        registry
            .register("flaky", "always", |_: Value, ctx: JobContext| async move {
                Err::<(), _>(JobError::payload(format!("attempt {}", ctx.attempt)))
            })
            .unwrap();
        let record = seen.clone();
        registry
            .register("count", "once", move |_: Value, ctx: JobContext| {
                let record = record.clone();
                async move {
                    record.lock().unwrap().push(ctx.job_id);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, JobError>(())
                }
            })
            .unwrap();

        let policy = RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Backoff::Fixed { delay_ms: 0 });
        let state = Arc::new(StateMachine::new(storage, registry, policy));
        let client = JobClient::new(state.clone());
        let shutdown = CancellationToken::new();

        for n in 0..pools {
            let config = WorkerConfig::default()
                .with_server_name(format!("server-{}", n))
                .with_count(4)
                .with_poll_interval(Duration::from_millis(20));
            let pool = Arc::new(WorkerPool::new(state.clone(), config));
            tokio::spawn(pool.run(shutdown.clone()));
        }

        Self {
            _dir: dir,
            dashboard: Dashboard::new(client.clone()),
            state,
            client,
            seen,
            shutdown,
        }
    }

    async fn wait_for(&self, id: &JobId, state: StateName) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = self.dashboard.get_job(id).await.unwrap();
                if record.state_name() == state {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {} never reached {}", id, state))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_job_succeeds() {
    let engine = Engine::start(1).await;
    let id = engine
        .client
        .enqueue("echo", "echo", json!({ "message": "hello" }))
        .await
        .unwrap();

    let record = engine.wait_for(&id, StateName::Succeeded).await;
    assert!(matches!(
        record.state,
        JobState::Succeeded { ref result, .. } if result == &json!("hello")
    ));
    let states: Vec<StateName> = record.history.iter().map(|e| e.state.name()).collect();
    assert_eq!(
        states,
        vec![StateName::Enqueued, StateName::Processing, StateName::Succeeded]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_job_exhausts_retries() {
    let engine = Engine::start(1).await;
    let id = engine.client.enqueue("flaky", "always", json!({})).await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let record = engine.dashboard.get_job(&id).await.unwrap();
            if record.state.is_exhausted() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job should exhaust its retries");

    assert_eq!(record.attempts, 3);
    let processing = record
        .history
        .iter()
        .filter(|e| e.state.name() == StateName::Processing)
        .count();
    assert_eq!(processing, 3);
    assert_eq!(record.last_error().as_deref(), Some("attempt 3"));

    let stats = engine.dashboard.stats().await.unwrap();
    assert_eq!(stats.states[&StateName::Failed], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_continuation_runs_after_parent() {
    let engine = Engine::start(1).await;
    let parent = engine
        .client
        .schedule(
            &Invocation::new("echo", "echo", json!({ "message": "parent" })),
            Duration::from_secs(3600),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    let child = engine
        .client
        .continue_with(
            &parent,
            &Invocation::new("echo", "echo", json!({ "message": "child" })),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        engine.dashboard.get_job(&child).await.unwrap().state_name(),
        StateName::Awaiting
    );

    engine.dashboard.requeue(&parent).await.unwrap();
    let parent_record = engine.wait_for(&parent, StateName::Succeeded).await;
    let child_record = engine.wait_for(&child, StateName::Succeeded).await;

    let parent_done = parent_record.history.last().unwrap().recorded_at;
    let child_started = child_record
        .history
        .iter()
        .find(|e| e.state.name() == StateName::Processing)
        .unwrap()
        .recorded_at;
    assert!(child_started >= parent_done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pools_run_each_job_once() {
    let engine = Engine::start(2).await;
    let mut ids = Vec::new();
    for _ in 0..40 {
        ids.push(engine.client.enqueue("count", "once", json!({})).await.unwrap());
    }
    for id in &ids {
        engine.wait_for(id, StateName::Succeeded).await;
    }

    let seen = engine.seen.lock().unwrap().clone();
    let mut runs: HashMap<JobId, usize> = HashMap::new();
    for id in seen {
        *runs.entry(id).or_default() += 1;
    }
    assert_eq!(runs.len(), ids.len());
    assert!(runs.values().all(|&n| n == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recurring_entry_fires_and_runs() {
    let engine = Engine::start(1).await;
    let entry = engine
        .client
        .add_or_update_recurring(
            "every-five",
            &Invocation::new("echo", "echo", json!({ "message": "cron" })),
            "*/5 * * * *",
            RecurringOptions::default(),
        )
        .await
        .unwrap();
    let first = entry.next_fire.unwrap();

    let scheduler = Scheduler::new(engine.state.clone(), SchedulerConfig::default());
    assert_eq!(scheduler.tick(first).await.unwrap().fired, 1);
    assert_eq!(scheduler.tick(first).await.unwrap().fired, 0);

    let recurring = engine.dashboard.list_recurring().await.unwrap();
    let job = recurring[0].last_job_id.unwrap();
    let record = engine.wait_for(&job, StateName::Succeeded).await;
    assert_eq!(
        record.parameters.get(jobmill_core::RECURRING_JOB_PARAM),
        Some(&json!("every-five"))
    );
    assert_eq!(recurring[0].next_fire, Some(first + chrono::Duration::minutes(5)));
}
