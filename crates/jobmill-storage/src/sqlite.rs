//! SQLite storage backend.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use jobmill_protocols::{
    JobId, JobRecord, JobState, Page, QueueInfo, RecurringFire, RetryRoute, ScheduleEntry,
    ScheduleKind, StateCounts, StateName, Storage, StorageError, Transition,
};

use crate::lease_deadline;
use crate::schema::init_schema;
use crate::sqlite_rows::{
    connection_error, fmt_ts, insert_history, insert_job, load_schedule, push_ready,
    query_jobs, query_schedules, remove_ready, require_job, sql_error, update_job,
    write_schedule,
};

/// SQLite-backed storage.
///
/// Mutations run in `BEGIN IMMEDIATE` transactions, so concurrent claimers
/// are serialized by the database write lock.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        info!("Opening SQLite job store at {}", path.display());
        let conn = Connection::open(path).await.map_err(connection_error)?;
        Self::init(conn).await
    }

    /// Create a private in-memory database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().await.map_err(connection_error)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.call(|conn| Ok(init_schema(conn)?))
            .await
            .map_err(connection_error)?;
        Ok(Self { conn })
    }

    /// Run `f` on the connection thread.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StorageError> + Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)))
            .await
            .map_err(connection_error)?
    }

    /// Run `f` inside an immediate transaction, committing on success.
    async fn in_tx<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StorageError> + Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_error)?;
            let value = f(&tx)?;
            tx.commit().map_err(sql_error)?;
            Ok(value)
        })
        .await
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn put(&self, record: JobRecord) -> Result<JobId, StorageError> {
        let id = record.id;
        self.in_tx(move |tx| insert_job(tx, &record)).await?;
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        let id = *id;
        self.with_conn(move |conn| require_job(conn, &id)).await
    }

    async fn update_state(
        &self,
        id: &JobId,
        transition: Transition,
    ) -> Result<JobRecord, StorageError> {
        let id = *id;
        let record = self
            .in_tx(move |tx| {
                let mut record = require_job(tx, &id)?;
                let was_enqueued = record.state_name() == StateName::Enqueued;
                transition.apply_to(&mut record, Utc::now())?;
                update_job(tx, &record)?;
                if let Some(entry) = record.history.last() {
                    insert_history(tx, &id, entry)?;
                }
                if was_enqueued {
                    remove_ready(tx, &id)?;
                }
                if let JobState::Enqueued { queue } = &record.state {
                    push_ready(tx, queue, &id)?;
                }
                Ok(record)
            })
            .await?;
        debug!("Job {} -> {}", id, record.state_name());
        Ok(record)
    }

    async fn set_parameter(
        &self,
        id: &JobId,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StorageError> {
        let id = *id;
        let name = name.to_string();
        self.in_tx(move |tx| {
            let mut record = require_job(tx, &id)?;
            record.parameters.insert(name, value);
            update_job(tx, &record)
        })
        .await
    }

    async fn list_by_state(
        &self,
        state: Option<StateName>,
        queue: Option<&str>,
        page: Page,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let queue = queue.map(str::to_string);
        self.with_conn(move |conn| {
            let mut filters = Vec::new();
            let mut args: Vec<String> = Vec::new();
            if let Some(state) = state {
                args.push(state.as_str().to_string());
                filters.push(format!("state = ?{}", args.len()));
            }
            if let Some(queue) = queue {
                args.push(queue);
                filters.push(format!("queue = ?{}", args.len()));
            }
            let mut clause = String::new();
            if !filters.is_empty() {
                clause.push_str("WHERE ");
                clause.push_str(&filters.join(" AND "));
            }
            clause.push_str(&format!(
                " ORDER BY updated_at DESC, id LIMIT {} OFFSET {}",
                page.limit(),
                page.offset()
            ));
            let refs: Vec<&dyn rusqlite::ToSql> =
                args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
            query_jobs(conn, &clause, &refs)
        })
        .await
    }

    async fn count_by_state(&self, queue: Option<&str>) -> Result<StateCounts, StorageError> {
        let queue = queue.map(str::to_string);
        self.with_conn(move |conn| {
            let mut counts: StateCounts = StateName::ALL.iter().map(|s| (*s, 0)).collect();
            let (sql, args): (&str, Vec<String>) = match queue {
                Some(queue) => (
                    "SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state",
                    vec![queue],
                ),
                None => ("SELECT state, COUNT(*) FROM jobs GROUP BY state", Vec::new()),
            };
            let mut stmt = conn.prepare(sql).map_err(sql_error)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(sql_error)?;
            for row in rows {
                let (state, count) = row.map_err(sql_error)?;
                let state: StateName = state.parse().map_err(StorageError::Serialization)?;
                counts.insert(state, count.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT q.name, (SELECT COUNT(*) FROM job_queue r WHERE r.queue = q.name)
                     FROM queues q ORDER BY q.name",
                )
                .map_err(sql_error)?;
            let queues = stmt
                .query_map([], |row| {
                    Ok(QueueInfo {
                        name: row.get(0)?,
                        enqueued: row.get::<_, i64>(1)?.max(0) as u64,
                    })
                })
                .map_err(sql_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_error)?;
            Ok(queues)
        })
        .await
    }

    async fn acquire_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, StorageError> {
        let queue = queue.to_string();
        let worker_id = worker_id.to_string();
        self.in_tx(move |tx| loop {
            let head: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, job_id FROM job_queue WHERE queue = ?1 ORDER BY seq LIMIT 1",
                    [&queue],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_error)?;
            let Some((seq, job_id)) = head else {
                return Ok(None);
            };
            tx.execute("DELETE FROM job_queue WHERE seq = ?1", [seq])
                .map_err(sql_error)?;

            let id: JobId = job_id
                .parse()
                .map_err(|e| StorageError::Serialization(format!("bad job id: {}", e)))?;
            let mut record = require_job(tx, &id)?;
            if record.state_name() != StateName::Enqueued {
                continue;
            }
            let now = Utc::now();
            let attempt = record.attempts + 1;
            record.apply(
                JobState::Processing {
                    worker_id: worker_id.clone(),
                    lease_expires_at: lease_deadline(now, lease),
                    attempt,
                },
                None,
                now,
            )?;
            update_job(tx, &record)?;
            if let Some(entry) = record.history.last() {
                insert_history(tx, &id, entry)?;
            }
            return Ok(Some(record));
        })
        .await
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StorageError> {
        let id = *id;
        let worker_id = worker_id.to_string();
        self.in_tx(move |tx| {
            let mut record = require_job(tx, &id)?;
            let now = Utc::now();
            match &mut record.state {
                JobState::Processing {
                    worker_id: holder,
                    lease_expires_at,
                    ..
                } if *holder == worker_id => {
                    *lease_expires_at = lease_deadline(now, lease);
                }
                _ => return Ok(false),
            }
            record.updated_at = now;
            update_job(tx, &record)?;
            Ok(true)
        })
        .await
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let now = fmt_ts(now);
        let limit = limit as i64;
        self.with_conn(move |conn| {
            query_jobs(
                conn,
                "WHERE state = 'processing' AND lease_expires_at <= ?1
                 ORDER BY lease_expires_at LIMIT ?2",
                &[&now, &limit],
            )
        })
        .await
    }

    async fn exhausted_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let cutoff = fmt_ts(cutoff);
        let limit = limit as i64;
        self.with_conn(move |conn| {
            query_jobs(
                conn,
                "WHERE state = 'failed' AND retry_at IS NULL AND updated_at <= ?1
                 ORDER BY updated_at LIMIT ?2",
                &[&cutoff, &limit],
            )
        })
        .await
    }

    async fn fail_with_retry(
        &self,
        id: &JobId,
        transition: Transition,
        route: RetryRoute,
    ) -> Result<JobRecord, StorageError> {
        let id = *id;
        let record = self
            .in_tx(move |tx| {
                let mut record = require_job(tx, &id)?;
                let was_enqueued = record.state_name() == StateName::Enqueued;
                let recorded = record.history.len();
                let entry = route.apply_to(&transition, &mut record, Utc::now())?;
                update_job(tx, &record)?;
                for history in &record.history[recorded..] {
                    insert_history(tx, &id, history)?;
                }
                if was_enqueued {
                    remove_ready(tx, &id)?;
                }
                if let JobState::Enqueued { queue } = &record.state {
                    push_ready(tx, queue, &id)?;
                }
                if let Some(entry) = entry {
                    write_schedule(tx, &entry)?;
                }
                Ok(record)
            })
            .await?;
        debug!("Job {} -> {} for retry", id, record.state_name());
        Ok(record)
    }

    async fn add_continuation(
        &self,
        parent: &JobId,
        child: JobRecord,
    ) -> Result<StateName, StorageError> {
        let parent = *parent;
        self.in_tx(move |tx| {
            let mut record = require_job(tx, &parent)?;
            insert_job(tx, &child)?;
            if !record.continuations.contains(&child.id) {
                record.continuations.push(child.id);
                update_job(tx, &record)?;
            }
            Ok(record.state_name())
        })
        .await
    }

    async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<(), StorageError> {
        self.in_tx(move |tx| write_schedule(tx, &entry)).await
    }

    async fn upsert_recurring(
        &self,
        entry: ScheduleEntry,
    ) -> Result<ScheduleEntry, StorageError> {
        self.in_tx(move |tx| {
            let stored = load_schedule(tx, &entry.id)?;
            let entry = entry.merged_with(stored.as_ref())?;
            write_schedule(tx, &entry)?;
            Ok(entry)
        })
        .await
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>, StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_schedule(conn, &id)).await
    }

    async fn remove_schedule(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM schedule WHERE id = ?1", [&id])
                .map_err(sql_error)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleEntry>, StorageError> {
        let now = fmt_ts(now);
        let limit = limit as i64;
        self.with_conn(move |conn| {
            query_schedules(
                conn,
                "SELECT entry FROM schedule WHERE next_fire IS NOT NULL AND next_fire <= ?1
                 ORDER BY next_fire LIMIT ?2",
                &[&now, &limit],
            )
        })
        .await
    }

    async fn list_schedules(
        &self,
        recurring_only: bool,
    ) -> Result<Vec<ScheduleEntry>, StorageError> {
        self.with_conn(move |conn| {
            let sql = if recurring_only {
                "SELECT entry FROM schedule WHERE kind = 'recurring' ORDER BY id"
            } else {
                "SELECT entry FROM schedule ORDER BY id"
            };
            query_schedules(conn, sql, &[])
        })
        .await
    }

    async fn advance_recurring(
        &self,
        id: &str,
        expected: Option<DateTime<Utc>>,
        fire: RecurringFire,
    ) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.in_tx(move |tx| {
            let Some(mut entry) = load_schedule(tx, &id)? else {
                return Ok(false);
            };
            if entry.next_fire != expected {
                return Ok(false);
            }
            let ScheduleKind::Recurring {
                last_fired,
                last_job_id,
                last_error,
                ..
            } = &mut entry.kind
            else {
                return Err(StorageError::conflict(&id, "not a recurring entry"));
            };
            *last_fired = Some(fire.fired_at);
            if fire.job_id.is_some() {
                *last_job_id = fire.job_id;
            }
            *last_error = fire.error;
            entry.next_fire = fire.next_fire;
            entry.updated_at = Utc::now();
            write_schedule(tx, &entry)?;
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
