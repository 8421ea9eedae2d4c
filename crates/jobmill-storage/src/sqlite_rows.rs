//! Row encoding for the SQLite backend.
//!
//! Helpers run inside `Connection::call` and report [`StorageError`]
//! directly, so callers can return domain errors out of a transaction.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use jobmill_protocols::{
    JobId, JobRecord, JobState, Payload, RetryPolicy, ScheduleEntry, StateHistoryEntry,
    StorageError,
};

/// Fixed-width UTC timestamp; sorts lexically in time order.
pub fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp {:?}: {}", raw, e)))
}

pub fn sql_error(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            ) =>
        {
            StorageError::Unavailable(err.to_string())
        }
        _ => StorageError::Backend(err.to_string()),
    }
}

pub fn connection_error(err: tokio_rusqlite::Error) -> StorageError {
    match err {
        tokio_rusqlite::Error::Rusqlite(e) => sql_error(e),
        other => StorageError::Unavailable(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Serialization(e.to_string()))
}

struct JobRow {
    id: String,
    display_name: String,
    payload: String,
    queue: String,
    state_data: String,
    attempts: u32,
    retry_policy: Option<String>,
    parameters: String,
    parent_id: Option<String>,
    continuations: String,
    created_at: String,
    updated_at: String,
}

const JOB_COLUMNS: &str = "id, display_name, payload, queue, state_data, attempts, retry_policy, \
     parameters, parent_id, continuations, created_at, updated_at";

fn parse_id(raw: &str) -> Result<JobId, StorageError> {
    raw.parse()
        .map_err(|e| StorageError::Serialization(format!("bad job id {:?}: {}", raw, e)))
}

fn load_history(conn: &Connection, id: &str) -> Result<Vec<StateHistoryEntry>, StorageError> {
    let mut stmt = conn
        .prepare(
            "SELECT state_data, reason, recorded_at FROM job_state_history
             WHERE job_id = ?1 ORDER BY id",
        )
        .map_err(sql_error)?;
    let rows = stmt
        .query_map([id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(sql_error)?;

    let mut history = Vec::new();
    for row in rows {
        let (state, reason, recorded_at) = row.map_err(sql_error)?;
        history.push(StateHistoryEntry {
            state: from_json(&state)?,
            reason,
            recorded_at: parse_ts(&recorded_at)?,
        });
    }
    Ok(history)
}

fn into_record(conn: &Connection, row: JobRow) -> Result<JobRecord, StorageError> {
    let retry_policy: Option<RetryPolicy> = match row.retry_policy {
        Some(raw) => Some(from_json(&raw)?),
        None => None,
    };
    let parent = match row.parent_id {
        Some(raw) => Some(parse_id(&raw)?),
        None => None,
    };
    let parameters: HashMap<String, serde_json::Value> = from_json(&row.parameters)?;
    let continuations: Vec<JobId> = from_json(&row.continuations)?;
    Ok(JobRecord {
        id: parse_id(&row.id)?,
        display_name: row.display_name,
        payload: Payload::from(row.payload),
        queue: row.queue,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
        state: from_json(&row.state_data)?,
        history: load_history(conn, &row.id)?,
        attempts: row.attempts,
        retry_policy,
        parameters,
        parent,
        continuations,
    })
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        display_name: row.get(1)?,
        payload: row.get(2)?,
        queue: row.get(3)?,
        state_data: row.get(4)?,
        attempts: row.get(5)?,
        retry_policy: row.get(6)?,
        parameters: row.get(7)?,
        parent_id: row.get(8)?,
        continuations: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub fn load_job(conn: &Connection, id: &JobId) -> Result<Option<JobRecord>, StorageError> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
    let row = conn
        .query_row(&sql, [id.to_string()], read_row)
        .optional()
        .map_err(sql_error)?;
    row.map(|row| into_record(conn, row)).transpose()
}

pub fn require_job(conn: &Connection, id: &JobId) -> Result<JobRecord, StorageError> {
    load_job(conn, id)?.ok_or_else(|| StorageError::NotFound(format!("job {}", id)))
}

/// Run a `SELECT <job columns> ...` query and load every matching record.
pub fn query_jobs(
    conn: &Connection,
    where_clause: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<JobRecord>, StorageError> {
    let sql = format!("SELECT {} FROM jobs {}", JOB_COLUMNS, where_clause);
    let mut stmt = conn.prepare(&sql).map_err(sql_error)?;
    let rows: Vec<JobRow> = stmt
        .query_map(args, read_row)
        .map_err(sql_error)?
        .collect::<Result<_, _>>()
        .map_err(sql_error)?;
    rows.into_iter().map(|row| into_record(conn, row)).collect()
}

fn retry_at(state: &JobState) -> Option<String> {
    match state {
        JobState::Failed {
            retry_at: Some(at), ..
        } => Some(fmt_ts(*at)),
        _ => None,
    }
}

/// Insert a new job row with its full history.
pub fn insert_job(conn: &Connection, record: &JobRecord) -> Result<(), StorageError> {
    let id = record.id.to_string();
    let exists: bool = conn
        .query_row("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)", [&id], |row| {
            row.get(0)
        })
        .map_err(sql_error)?;
    if exists {
        return Err(StorageError::AlreadyExists(id));
    }

    let retry_policy = record.retry_policy.as_ref().map(to_json).transpose()?;
    conn.execute(
        "INSERT INTO jobs (id, display_name, payload, queue, state, state_data, attempts,
            retry_policy, parameters, parent_id, continuations, lease_expires_at, retry_at,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            id,
            record.display_name,
            record.payload.to_text(),
            record.queue,
            record.state_name().as_str(),
            to_json(&record.state)?,
            record.attempts,
            retry_policy,
            to_json(&record.parameters)?,
            record.parent.map(|p| p.to_string()),
            to_json(&record.continuations)?,
            record.state.lease_expires_at().map(fmt_ts),
            retry_at(&record.state),
            fmt_ts(record.created_at),
            fmt_ts(record.updated_at),
        ],
    )
    .map_err(sql_error)?;

    for entry in &record.history {
        insert_history(conn, &record.id, entry)?;
    }
    register_queue(conn, &record.queue)?;
    if let JobState::Enqueued { queue } = &record.state {
        push_ready(conn, queue, &record.id)?;
    }
    Ok(())
}

/// Write back every mutable column of an existing job.
pub fn update_job(conn: &Connection, record: &JobRecord) -> Result<(), StorageError> {
    let retry_policy = record.retry_policy.as_ref().map(to_json).transpose()?;
    conn.execute(
        "UPDATE jobs SET queue = ?2, state = ?3, state_data = ?4, attempts = ?5,
            retry_policy = ?6, parameters = ?7, continuations = ?8, lease_expires_at = ?9,
            retry_at = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            record.id.to_string(),
            record.queue,
            record.state_name().as_str(),
            to_json(&record.state)?,
            record.attempts,
            retry_policy,
            to_json(&record.parameters)?,
            to_json(&record.continuations)?,
            record.state.lease_expires_at().map(fmt_ts),
            retry_at(&record.state),
            fmt_ts(record.updated_at),
        ],
    )
    .map_err(sql_error)?;
    Ok(())
}

pub fn insert_history(
    conn: &Connection,
    id: &JobId,
    entry: &StateHistoryEntry,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO job_state_history (job_id, state, state_data, reason, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id.to_string(),
            entry.state.name().as_str(),
            to_json(&entry.state)?,
            entry.reason,
            fmt_ts(entry.recorded_at),
        ],
    )
    .map_err(sql_error)?;
    Ok(())
}

pub fn register_queue(conn: &Connection, queue: &str) -> Result<(), StorageError> {
    conn.execute("INSERT OR IGNORE INTO queues (name) VALUES (?1)", [queue])
        .map_err(sql_error)?;
    Ok(())
}

pub fn push_ready(conn: &Connection, queue: &str, id: &JobId) -> Result<(), StorageError> {
    register_queue(conn, queue)?;
    conn.execute(
        "INSERT OR REPLACE INTO job_queue (queue, job_id) VALUES (?1, ?2)",
        params![queue, id.to_string()],
    )
    .map_err(sql_error)?;
    Ok(())
}

pub fn remove_ready(conn: &Connection, id: &JobId) -> Result<(), StorageError> {
    conn.execute("DELETE FROM job_queue WHERE job_id = ?1", [id.to_string()])
        .map_err(sql_error)?;
    Ok(())
}

pub fn load_schedule(conn: &Connection, id: &str) -> Result<Option<ScheduleEntry>, StorageError> {
    let raw: Option<String> = conn
        .query_row("SELECT entry FROM schedule WHERE id = ?1", [id], |row| row.get(0))
        .optional()
        .map_err(sql_error)?;
    raw.map(|raw| from_json(&raw)).transpose()
}

pub fn query_schedules(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ScheduleEntry>, StorageError> {
    let mut stmt = conn.prepare(sql).map_err(sql_error)?;
    let raws: Vec<String> = stmt
        .query_map(args, |row| row.get(0))
        .map_err(sql_error)?
        .collect::<Result<_, _>>()
        .map_err(sql_error)?;
    raws.iter().map(|raw| from_json(raw)).collect()
}

pub fn write_schedule(conn: &Connection, entry: &ScheduleEntry) -> Result<(), StorageError> {
    let kind = if entry.is_recurring() { "recurring" } else { "run_at" };
    conn.execute(
        "INSERT INTO schedule (id, kind, entry, next_fire, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            kind = excluded.kind, entry = excluded.entry,
            next_fire = excluded.next_fire, updated_at = excluded.updated_at",
        params![
            entry.id,
            kind,
            to_json(entry)?,
            entry.next_fire.map(fmt_ts),
            fmt_ts(entry.updated_at),
        ],
    )
    .map_err(sql_error)?;
    Ok(())
}
