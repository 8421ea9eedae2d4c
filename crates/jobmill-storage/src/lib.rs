//! Storage backends for jobmill.
//!
//! - [`MemoryStorage`] keeps everything in process, for tests and
//!   single-process development.
//! - [`SqliteStorage`] persists to a SQLite file; every mutating call runs in
//!   an immediate transaction, which makes lease claims atomic across
//!   connections and processes.

mod memory;
mod schema;
mod sqlite;
mod sqlite_rows;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use chrono::{DateTime, Duration, Utc};

/// Lease expiry for a lease taken at `now`.
pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: std::time::Duration) -> DateTime<Utc> {
    let lease = Duration::from_std(lease).unwrap_or(Duration::MAX);
    now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod conformance;
