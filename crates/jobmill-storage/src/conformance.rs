//! Behaviour shared by every backend, run against each one in its tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use jobmill_protocols::{
    FailureKind, JobId, JobRecord, JobState, Page, Payload, RecurringFire, ScheduleEntry,
    RetryRoute, ScheduleKind, StateName, Storage, StorageError, Transition,
};

const LEASE: Duration = Duration::from_secs(30);

fn enqueued(queue: &str) -> JobRecord {
    JobRecord::new(
        "echo.echo",
        Payload::from(r#"{"v":1}"#),
        queue,
        JobState::Enqueued {
            queue: queue.to_string(),
        },
    )
}

fn recurring(id: &str, next_fire: chrono::DateTime<Utc>) -> ScheduleEntry {
    let now = Utc::now();
    ScheduleEntry {
        id: id.to_string(),
        kind: ScheduleKind::Recurring {
            cron: "*/5 * * * *".to_string(),
            timezone: "UTC".to_string(),
            payload: Payload::from("{}"),
            display_name: "demo.simple".to_string(),
            queue: "default".to_string(),
            retry_policy: None,
            last_fired: None,
            last_job_id: None,
            last_error: None,
        },
        next_fire: Some(next_fire),
        created_at: now,
        updated_at: now,
    }
}

pub async fn run_all(storage: &dyn Storage) {
    put_and_get(storage).await;
    lease_is_fifo_and_exclusive(storage).await;
    guarded_updates(storage).await;
    renew_and_expire(storage).await;
    listing_and_counts(storage).await;
    continuations(storage).await;
    retry_release(storage).await;
    schedules(storage).await;
    recurring_upsert(storage).await;
    exhausted_listing(storage).await;
}

async fn put_and_get(storage: &dyn Storage) {
    let record = enqueued("put-get").with_parameter("origin", json!("test"));
    let id = storage.put(record.clone()).await.unwrap();
    let loaded = storage.get(&id).await.unwrap();
    assert_eq!(loaded.id, id);
    assert_eq!(loaded.payload, record.payload);
    assert_eq!(loaded.history.len(), 1);
    assert_eq!(loaded.parameters.get("origin"), Some(&json!("test")));

    assert!(matches!(
        storage.put(record).await,
        Err(StorageError::AlreadyExists(_))
    ));
    assert!(matches!(
        storage.get(&JobId::new()).await,
        Err(StorageError::NotFound(_))
    ));

    storage.set_parameter(&id, "retry_count", json!(2)).await.unwrap();
    let loaded = storage.get(&id).await.unwrap();
    assert_eq!(loaded.parameters.get("retry_count"), Some(&json!(2)));
}

async fn lease_is_fifo_and_exclusive(storage: &dyn Storage) {
    let first = storage.put(enqueued("fifo")).await.unwrap();
    let second = storage.put(enqueued("fifo")).await.unwrap();

    let leased = storage.acquire_lease("fifo", "w:0", LEASE).await.unwrap().unwrap();
    assert_eq!(leased.id, first);
    assert_eq!(leased.attempts, 1);
    assert_eq!(leased.state.lease_holder(), Some("w:0"));

    let leased = storage.acquire_lease("fifo", "w:1", LEASE).await.unwrap().unwrap();
    assert_eq!(leased.id, second);

    assert!(storage.acquire_lease("fifo", "w:2", LEASE).await.unwrap().is_none());
    assert!(storage.acquire_lease("nothing-here", "w:2", LEASE).await.unwrap().is_none());
}

async fn guarded_updates(storage: &dyn Storage) {
    let id = storage.put(enqueued("guards")).await.unwrap();
    storage.acquire_lease("guards", "w:0", LEASE).await.unwrap().unwrap();

    let wrong_holder = Transition::to(JobState::Succeeded {
        result: json!("x"),
        duration_ms: 1,
    })
    .held_by("w:9");
    assert!(matches!(
        storage.update_state(&id, wrong_holder).await,
        Err(StorageError::Conflict { .. })
    ));

    let failed = Transition::to(JobState::Failed {
        kind: FailureKind::Payload,
        message: Some("boom".to_string()),
        attempt: 1,
        retry_at: None,
    })
    .held_by("w:0")
    .from_states(&[StateName::Processing]);
    let record = storage.update_state(&id, failed).await.unwrap();
    assert_eq!(record.state_name(), StateName::Failed);
    assert_eq!(record.history.len(), 3);

    let requeue = Transition::to(JobState::Enqueued {
        queue: "guards".to_string(),
    })
    .from_states(&[StateName::Failed])
    .with_reason("retry");
    storage.update_state(&id, requeue).await.unwrap();
    let again = storage.acquire_lease("guards", "w:1", LEASE).await.unwrap().unwrap();
    assert_eq!(again.id, id);
    assert_eq!(again.attempts, 2);

    let done = Transition::to(JobState::Succeeded {
        result: json!({"ok": true}),
        duration_ms: 5,
    })
    .held_by("w:1");
    storage.update_state(&id, done).await.unwrap();

    let invalid = Transition::to(JobState::Enqueued {
        queue: "guards".to_string(),
    });
    assert!(matches!(
        storage.update_state(&id, invalid).await,
        Err(StorageError::InvalidTransition { .. })
    ));

    let stored = storage.get(&id).await.unwrap();
    let states: Vec<StateName> = stored.history.iter().map(|e| e.state.name()).collect();
    assert_eq!(
        states,
        vec![
            StateName::Enqueued,
            StateName::Processing,
            StateName::Failed,
            StateName::Enqueued,
            StateName::Processing,
            StateName::Succeeded,
        ]
    );
    assert_eq!(stored.history[3].reason.as_deref(), Some("retry"));
}

async fn renew_and_expire(storage: &dyn Storage) {
    let id = storage.put(enqueued("leases")).await.unwrap();
    storage
        .acquire_lease("leases", "w:0", Duration::from_millis(1))
        .await
        .unwrap()
        .unwrap();
    assert!(!storage.renew_lease(&id, "w:1", LEASE).await.unwrap());

    let later = Utc::now() + ChronoDuration::seconds(5);
    let expired = storage.expired_leases(later, 10).await.unwrap();
    assert!(expired.iter().any(|r| r.id == id));

    assert!(storage.renew_lease(&id, "w:0", LEASE).await.unwrap());
    let expired = storage.expired_leases(later, 10).await.unwrap();
    assert!(!expired.iter().any(|r| r.id == id));
}

async fn listing_and_counts(storage: &dyn Storage) {
    for _ in 0..3 {
        storage.put(enqueued("listing")).await.unwrap();
    }
    let scheduled = JobRecord::new(
        "demo.simple",
        Payload::from("{}"),
        "listing",
        JobState::Scheduled {
            enqueue_at: Utc::now() + ChronoDuration::hours(1),
        },
    );
    storage.put(scheduled).await.unwrap();

    let counts = storage.count_by_state(Some("listing")).await.unwrap();
    assert_eq!(counts.get(&StateName::Enqueued), Some(&3));
    assert_eq!(counts.get(&StateName::Scheduled), Some(&1));
    assert_eq!(counts.get(&StateName::Succeeded), Some(&0));

    let page = storage
        .list_by_state(Some(StateName::Enqueued), Some("listing"), Page::new(1, 2))
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
    let rest = storage
        .list_by_state(Some(StateName::Enqueued), Some("listing"), Page::new(2, 2))
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert!(!page.iter().any(|r| r.id == rest[0].id));

    let all = storage
        .list_by_state(None, Some("listing"), Page::new(1, 50))
        .await
        .unwrap();
    assert_eq!(all.len(), 4);

    let queues = storage.list_queues().await.unwrap();
    let listing = queues.iter().find(|q| q.name == "listing").unwrap();
    assert_eq!(listing.enqueued, 3);
}

async fn continuations(storage: &dyn Storage) {
    let parent = storage.put(enqueued("cont")).await.unwrap();
    let child = JobRecord::new(
        "demo.simple",
        Payload::from("{}"),
        "cont",
        JobState::Awaiting { parent },
    );
    let child_id = child.id;

    let state = storage.add_continuation(&parent, child.clone()).await.unwrap();
    assert_eq!(state, StateName::Enqueued);
    assert!(matches!(
        storage.add_continuation(&parent, child).await,
        Err(StorageError::AlreadyExists(_))
    ));

    let parent_record = storage.get(&parent).await.unwrap();
    assert_eq!(parent_record.continuations, vec![child_id]);
    let child_record = storage.get(&child_id).await.unwrap();
    assert_eq!(child_record.parent, Some(parent));
    assert_eq!(child_record.state_name(), StateName::Awaiting);

    // Awaiting jobs are not in the ready index.
    let leased = storage.acquire_lease("cont", "w:0", LEASE).await.unwrap().unwrap();
    assert_eq!(leased.id, parent);
    assert!(storage.acquire_lease("cont", "w:0", LEASE).await.unwrap().is_none());

    // A missing parent leaves no orphaned child behind.
    let orphan = JobRecord::new(
        "demo.simple",
        Payload::from("{}"),
        "cont",
        JobState::Awaiting {
            parent: JobId::new(),
        },
    );
    let orphan_id = orphan.id;
    assert!(matches!(
        storage.add_continuation(&JobId::new(), orphan).await,
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        storage.get(&orphan_id).await,
        Err(StorageError::NotFound(_))
    ));
}

fn failed_with_retry(retry_at: chrono::DateTime<Utc>) -> JobState {
    JobState::Failed {
        kind: FailureKind::Payload,
        message: Some("boom".to_string()),
        attempt: 1,
        retry_at: Some(retry_at),
    }
}

async fn retry_release(storage: &dyn Storage) {
    let held = |to| Transition::to(to).from_states(&[StateName::Processing]).held_by("w:0");

    // Zero delay goes straight back to the queue.
    let id = storage.put(enqueued("retry")).await.unwrap();
    storage.acquire_lease("retry", "w:0", LEASE).await.unwrap();
    let record = storage
        .fail_with_retry(&id, held(failed_with_retry(Utc::now())), RetryRoute::Requeue)
        .await
        .unwrap();
    assert_eq!(record.state_name(), StateName::Enqueued);
    let names: Vec<StateName> = storage
        .get(&id)
        .await
        .unwrap()
        .history
        .iter()
        .map(|e| e.state.name())
        .collect();
    assert_eq!(
        names,
        vec![
            StateName::Enqueued,
            StateName::Processing,
            StateName::Failed,
            StateName::Enqueued
        ]
    );
    let again = storage.acquire_lease("retry", "w:1", LEASE).await.unwrap().unwrap();
    assert_eq!((again.id, again.attempts), (id, 2));

    // A delayed retry leaves the job failed behind a run-at entry.
    let retry_at = Utc::now() + ChronoDuration::minutes(5);
    let record = storage
        .fail_with_retry(
            &id,
            Transition::to(failed_with_retry(retry_at))
                .from_states(&[StateName::Processing])
                .held_by("w:1"),
            RetryRoute::RunAt,
        )
        .await
        .unwrap();
    assert_eq!(record.state.retry_at(), Some(retry_at));
    let entry = storage.get_schedule(&id.to_string()).await.unwrap().unwrap();
    assert_eq!(entry.next_fire, Some(retry_at));
    assert!(storage.acquire_lease("retry", "w:1", LEASE).await.unwrap().is_none());

    storage.remove_schedule(&id.to_string()).await.unwrap();

    // A failed guard writes nothing.
    let stranger = storage.put(enqueued("retry")).await.unwrap();
    storage.acquire_lease("retry", "w:2", LEASE).await.unwrap();
    assert!(matches!(
        storage
            .fail_with_retry(&stranger, held(failed_with_retry(retry_at)), RetryRoute::RunAt)
            .await,
        Err(StorageError::Conflict { .. })
    ));
    assert!(storage.get_schedule(&stranger.to_string()).await.unwrap().is_none());
    assert_eq!(
        storage.get(&stranger).await.unwrap().state_name(),
        StateName::Processing
    );

    // The failed state must carry a retry time.
    assert!(matches!(
        storage
            .fail_with_retry(
                &stranger,
                Transition::to(JobState::Failed {
                    kind: FailureKind::Payload,
                    message: None,
                    attempt: 1,
                    retry_at: None,
                }),
                RetryRoute::Requeue,
            )
            .await,
        Err(StorageError::Conflict { .. })
    ));
}

async fn schedules(storage: &dyn Storage) {
    let now = Utc::now();
    let job_id = JobId::new();
    storage
        .upsert_schedule(ScheduleEntry::run_at(job_id, now - ChronoDuration::seconds(1)))
        .await
        .unwrap();
    storage
        .upsert_schedule(recurring("later", now + ChronoDuration::hours(1)))
        .await
        .unwrap();
    let due_at = now - ChronoDuration::minutes(1);
    storage.upsert_schedule(recurring("report", due_at)).await.unwrap();

    let due = storage.due_schedules(now, 10).await.unwrap();
    let ids: Vec<&str> = due.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["report", job_id.to_string().as_str()]);

    assert_eq!(storage.list_schedules(true).await.unwrap().len(), 2);
    assert_eq!(storage.list_schedules(false).await.unwrap().len(), 3);

    let next = due_at + ChronoDuration::minutes(5);
    let fired = JobId::new();
    let fire = RecurringFire {
        fired_at: due_at,
        next_fire: Some(next),
        job_id: Some(fired),
        error: None,
    };
    assert!(storage.advance_recurring("report", Some(due_at), fire.clone()).await.unwrap());
    // Second scheduler with the stale watermark loses.
    assert!(!storage.advance_recurring("report", Some(due_at), fire).await.unwrap());

    let entry = storage.get_schedule("report").await.unwrap().unwrap();
    assert_eq!(entry.next_fire, Some(next));
    match entry.kind {
        ScheduleKind::Recurring {
            last_fired,
            last_job_id,
            ..
        } => {
            assert_eq!(last_fired, Some(due_at));
            assert_eq!(last_job_id, Some(fired));
        }
        other => panic!("unexpected kind {:?}", other),
    }

    assert!(storage.remove_schedule("report").await.unwrap());
    assert!(!storage.remove_schedule("report").await.unwrap());
    assert!(storage.get_schedule("report").await.unwrap().is_none());
}

async fn recurring_upsert(storage: &dyn Storage) {
    let first_boundary = Utc::now() - ChronoDuration::minutes(1);
    let stored = storage
        .upsert_recurring(recurring("digest", first_boundary))
        .await
        .unwrap();
    assert_eq!(stored.next_fire, Some(first_boundary));

    let fired = JobId::new();
    let next = first_boundary + ChronoDuration::minutes(5);
    let fire = RecurringFire {
        fired_at: first_boundary,
        next_fire: Some(next),
        job_id: Some(fired),
        error: None,
    };
    assert!(storage.advance_recurring("digest", Some(first_boundary), fire).await.unwrap());

    // A caller that computed its entry before the fire cannot rewind the watermark.
    let stale = recurring("digest", first_boundary);
    let merged = storage.upsert_recurring(stale).await.unwrap();
    assert_eq!(merged.next_fire, Some(next));
    assert_eq!(merged.created_at, stored.created_at);
    let entry = storage.get_schedule("digest").await.unwrap().unwrap();
    assert_eq!(entry.next_fire, Some(next));
    match entry.kind {
        ScheduleKind::Recurring {
            last_fired,
            last_job_id,
            ..
        } => {
            assert_eq!(last_fired, Some(first_boundary));
            assert_eq!(last_job_id, Some(fired));
        }
        other => panic!("unexpected kind {:?}", other),
    }
    assert!(storage.due_schedules(Utc::now(), 10).await.unwrap().iter().all(|e| e.id != "digest"));

    // A run-at entry with the same id is not replaced.
    let job_id = JobId::new();
    storage
        .upsert_schedule(ScheduleEntry::run_at(job_id, Utc::now()))
        .await
        .unwrap();
    let clash = recurring(&job_id.to_string(), Utc::now());
    assert!(matches!(
        storage.upsert_recurring(clash).await,
        Err(StorageError::Conflict { .. })
    ));
    assert!(!storage.get_schedule(&job_id.to_string()).await.unwrap().unwrap().is_recurring());
    storage.remove_schedule(&job_id.to_string()).await.unwrap();
    storage.remove_schedule("digest").await.unwrap();
}

async fn exhausted_listing(storage: &dyn Storage) {
    let id = storage.put(enqueued("exhausted")).await.unwrap();
    storage.acquire_lease("exhausted", "w:0", LEASE).await.unwrap();
    storage
        .update_state(
            &id,
            Transition::to(JobState::Failed {
                kind: FailureKind::Payload,
                message: None,
                attempt: 1,
                retry_at: None,
            }),
        )
        .await
        .unwrap();

    let before = storage
        .exhausted_before(Utc::now() - ChronoDuration::hours(1), 10)
        .await
        .unwrap();
    assert!(!before.iter().any(|r| r.id == id));
    let after = storage
        .exhausted_before(Utc::now() + ChronoDuration::seconds(1), 10)
        .await
        .unwrap();
    assert!(after.iter().any(|r| r.id == id));
}

/// Many workers race for a handful of jobs; each job is leased exactly once.
pub async fn concurrent_single_winner<S: Storage + 'static>(storage: Arc<S>) {
    const JOBS: usize = 20;
    const WORKERS: usize = 8;

    for _ in 0..JOBS {
        storage.put(enqueued("race")).await.unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut won = Vec::new();
            let worker_id = format!("w:{}", worker);
            while let Some(record) = storage.acquire_lease("race", &worker_id, LEASE).await.unwrap() {
                won.push(record.id);
                tokio::task::yield_now().await;
            }
            won
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {} leased twice", id);
        }
    }
    assert_eq!(seen.len(), JOBS);
}
