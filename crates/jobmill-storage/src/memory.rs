//! In-memory storage backend.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use jobmill_protocols::{
    JobId, JobRecord, JobState, Page, QueueInfo, RecurringFire, RetryRoute, ScheduleEntry,
    ScheduleKind, StateCounts, StateName, Storage, StorageError, Transition,
};

use crate::lease_deadline;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    /// Ready index per queue, oldest first.
    queues: BTreeMap<String, VecDeque<JobId>>,
    schedules: BTreeMap<String, ScheduleEntry>,
}

impl Inner {
    fn job_mut(&mut self, id: &JobId) -> Result<&mut JobRecord, StorageError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job {}", id)))
    }

    fn push_ready(&mut self, queue: &str, id: JobId) {
        self.queues.entry(queue.to_string()).or_default().push_back(id);
    }

    fn remove_ready(&mut self, id: &JobId) {
        for ready in self.queues.values_mut() {
            ready.retain(|queued| queued != id);
        }
    }
}

/// Storage kept in process memory.
///
/// A single mutex guards all maps, so every operation is atomic.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    available: AtomicBool,
    /// Operations that fail once on their next call.
    faults: Mutex<Vec<&'static str>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Simulate losing the backend. While unavailable every call fails with
    /// [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next call of the named [`Storage`] method with
    /// [`StorageError::Unavailable`], without touching any data.
    pub fn fail_next(&self, operation: &'static str) {
        self.faults.lock().push(operation);
    }

    fn ensure_available(&self, operation: &'static str) -> Result<(), StorageError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory backend offline".to_string()));
        }
        let mut faults = self.faults.lock();
        if let Some(pos) = faults.iter().position(|f| *f == operation) {
            faults.remove(pos);
            return Err(StorageError::Unavailable(format!(
                "memory backend dropped {}",
                operation
            )));
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, record: JobRecord) -> Result<JobId, StorageError> {
        self.ensure_available("put")?;
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&record.id) {
            return Err(StorageError::AlreadyExists(record.id.to_string()));
        }
        let id = record.id;
        if let JobState::Enqueued { queue } = &record.state {
            let queue = queue.clone();
            inner.push_ready(&queue, id);
        } else {
            inner.queues.entry(record.queue.clone()).or_default();
        }
        inner.jobs.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        self.ensure_available("get")?;
        self.inner
            .lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job {}", id)))
    }

    async fn update_state(
        &self,
        id: &JobId,
        transition: Transition,
    ) -> Result<JobRecord, StorageError> {
        self.ensure_available("update_state")?;
        let mut inner = self.inner.lock();
        let record = inner.job_mut(id)?;
        let was_enqueued = record.state_name() == StateName::Enqueued;
        transition.apply_to(record, Utc::now())?;
        let updated = record.clone();

        if was_enqueued {
            inner.remove_ready(id);
        }
        if let JobState::Enqueued { queue } = &updated.state {
            inner.push_ready(queue, *id);
        }
        debug!("Job {} -> {}", id, updated.state_name());
        Ok(updated)
    }

    async fn set_parameter(
        &self,
        id: &JobId,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StorageError> {
        self.ensure_available("set_parameter")?;
        let mut inner = self.inner.lock();
        let record = inner.job_mut(id)?;
        record.parameters.insert(name.to_string(), value);
        Ok(())
    }

    async fn list_by_state(
        &self,
        state: Option<StateName>,
        queue: Option<&str>,
        page: Page,
    ) -> Result<Vec<JobRecord>, StorageError> {
        self.ensure_available("list_by_state")?;
        let inner = self.inner.lock();
        let mut matching: Vec<&JobRecord> = inner
            .jobs
            .values()
            .filter(|r| state.is_none_or(|s| r.state_name() == s))
            .filter(|r| queue.is_none_or(|q| r.queue == q))
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(matching
            .into_iter()
            .skip(page.offset())
            .take(page.limit())
            .cloned()
            .collect())
    }

    async fn count_by_state(&self, queue: Option<&str>) -> Result<StateCounts, StorageError> {
        self.ensure_available("count_by_state")?;
        let inner = self.inner.lock();
        let mut counts: StateCounts = StateName::ALL.iter().map(|s| (*s, 0)).collect();
        for record in inner.jobs.values() {
            if queue.is_none_or(|q| record.queue == q) {
                *counts.entry(record.state_name()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>, StorageError> {
        self.ensure_available("list_queues")?;
        let inner = self.inner.lock();
        Ok(inner
            .queues
            .iter()
            .map(|(name, ready)| QueueInfo {
                name: name.clone(),
                enqueued: ready.len() as u64,
            })
            .collect())
    }

    async fn acquire_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, StorageError> {
        self.ensure_available("acquire_lease")?;
        let mut inner = self.inner.lock();
        loop {
            let Some(id) = inner.queues.get_mut(queue).and_then(|ready| ready.pop_front()) else {
                return Ok(None);
            };
            let now = Utc::now();
            let Some(record) = inner.jobs.get_mut(&id) else {
                continue;
            };
            if record.state_name() != StateName::Enqueued {
                continue;
            }
            let attempt = record.attempts + 1;
            record.apply(
                JobState::Processing {
                    worker_id: worker_id.to_string(),
                    lease_expires_at: lease_deadline(now, lease),
                    attempt,
                },
                None,
                now,
            )?;
            return Ok(Some(record.clone()));
        }
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StorageError> {
        self.ensure_available("renew_lease")?;
        let mut inner = self.inner.lock();
        let record = inner.job_mut(id)?;
        match &mut record.state {
            JobState::Processing {
                worker_id: holder,
                lease_expires_at,
                ..
            } if holder == worker_id => {
                let now = Utc::now();
                *lease_expires_at = lease_deadline(now, lease);
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        self.ensure_available("expired_leases")?;
        let inner = self.inner.lock();
        let mut expired: Vec<&JobRecord> = inner
            .jobs
            .values()
            .filter(|r| r.state.lease_expires_at().is_some_and(|at| at <= now))
            .collect();
        expired.sort_by_key(|r| r.state.lease_expires_at());
        Ok(expired.into_iter().take(limit).cloned().collect())
    }

    async fn exhausted_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        self.ensure_available("exhausted_before")?;
        let inner = self.inner.lock();
        let mut exhausted: Vec<&JobRecord> = inner
            .jobs
            .values()
            .filter(|r| r.state.is_exhausted() && r.updated_at <= cutoff)
            .collect();
        exhausted.sort_by_key(|r| r.updated_at);
        Ok(exhausted.into_iter().take(limit).cloned().collect())
    }

    async fn fail_with_retry(
        &self,
        id: &JobId,
        transition: Transition,
        route: RetryRoute,
    ) -> Result<JobRecord, StorageError> {
        self.ensure_available("fail_with_retry")?;
        let mut inner = self.inner.lock();
        let mut record = inner.job_mut(id)?.clone();
        let was_enqueued = record.state_name() == StateName::Enqueued;
        let entry = route.apply_to(&transition, &mut record, Utc::now())?;

        if was_enqueued {
            inner.remove_ready(id);
        }
        if let JobState::Enqueued { queue } = &record.state {
            inner.push_ready(queue, *id);
        }
        if let Some(entry) = entry {
            inner.schedules.insert(entry.id.clone(), entry);
        }
        inner.jobs.insert(*id, record.clone());
        debug!("Job {} -> {} for retry", id, record.state_name());
        Ok(record)
    }

    async fn add_continuation(
        &self,
        parent: &JobId,
        child: JobRecord,
    ) -> Result<StateName, StorageError> {
        self.ensure_available("add_continuation")?;
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&child.id) {
            return Err(StorageError::AlreadyExists(child.id.to_string()));
        }
        let record = inner.job_mut(parent)?;
        if !record.continuations.contains(&child.id) {
            record.continuations.push(child.id);
        }
        let parent_state = record.state_name();
        if let JobState::Enqueued { queue } = &child.state {
            let queue = queue.clone();
            inner.push_ready(&queue, child.id);
        } else {
            inner.queues.entry(child.queue.clone()).or_default();
        }
        inner.jobs.insert(child.id, child);
        Ok(parent_state)
    }

    async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<(), StorageError> {
        self.ensure_available("upsert_schedule")?;
        self.inner.lock().schedules.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn upsert_recurring(
        &self,
        entry: ScheduleEntry,
    ) -> Result<ScheduleEntry, StorageError> {
        self.ensure_available("upsert_recurring")?;
        let mut inner = self.inner.lock();
        let stored = inner.schedules.get(&entry.id);
        let entry = entry.merged_with(stored)?;
        inner.schedules.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>, StorageError> {
        self.ensure_available("get_schedule")?;
        Ok(self.inner.lock().schedules.get(id).cloned())
    }

    async fn remove_schedule(&self, id: &str) -> Result<bool, StorageError> {
        self.ensure_available("remove_schedule")?;
        Ok(self.inner.lock().schedules.remove(id).is_some())
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleEntry>, StorageError> {
        self.ensure_available("due_schedules")?;
        let inner = self.inner.lock();
        let mut due: Vec<&ScheduleEntry> = inner
            .schedules
            .values()
            .filter(|e| e.next_fire.is_some_and(|at| at <= now))
            .collect();
        due.sort_by_key(|e| e.next_fire);
        Ok(due.into_iter().take(limit).cloned().collect())
    }

    async fn list_schedules(
        &self,
        recurring_only: bool,
    ) -> Result<Vec<ScheduleEntry>, StorageError> {
        self.ensure_available("list_schedules")?;
        let inner = self.inner.lock();
        Ok(inner
            .schedules
            .values()
            .filter(|e| !recurring_only || e.is_recurring())
            .cloned()
            .collect())
    }

    async fn advance_recurring(
        &self,
        id: &str,
        expected: Option<DateTime<Utc>>,
        fire: RecurringFire,
    ) -> Result<bool, StorageError> {
        self.ensure_available("advance_recurring")?;
        let mut inner = self.inner.lock();
        let Some(entry) = inner.schedules.get_mut(id) else {
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
            return Err(StorageError::conflict(id, "not a recurring entry"));
        };
        *last_fired = Some(fire.fired_at);
        if fire.job_id.is_some() {
            *last_job_id = fire.job_id;
        }
        *last_error = fire.error;
        entry.next_fire = fire.next_fire;
        entry.updated_at = Utc::now();
        Ok(true)
    }
}
