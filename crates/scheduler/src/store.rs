//! Scheduler storage: job definitions, the job queue, and the cycle marker.
//!
//! The trait is the concurrency boundary: `claim_oldest_due` must be an
//! atomic conditional write (one UPDATE guarded on the prior status), never
//! read-then-write, because overlapping cron invocations race on the same
//! rows. The in-memory implementation serializes through one mutex and is
//! intended for tests and development; `mailforge-infra` provides Postgres.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use mailforge_core::{JobId, QueueEntryId};

use crate::types::{EntryResolution, EntryStatus, JobDefinition, QueueEntry};

/// Scheduler store error.
#[derive(Debug, Clone, Error)]
pub enum SchedulerStoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("queue entry not found: {0}")]
    EntryNotFound(QueueEntryId),
    /// Another claimant won a conditional update; retryable.
    #[error("claim contention: {0}")]
    Contention(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Counts per queue-entry state, for the cycle report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub done_success: usize,
    pub done_failed: usize,
}

#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Insert or replace a job definition by id.
    async fn upsert_job(&self, job: &JobDefinition) -> Result<(), SchedulerStoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobDefinition>, SchedulerStoreError>;

    async fn list_jobs(&self) -> Result<Vec<JobDefinition>, SchedulerStoreError>;

    async fn set_job_last_run(
        &self,
        id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerStoreError>;

    /// Any non-done entry for the job? Guards against duplicate fires.
    async fn has_pending_entry(&self, job_id: JobId) -> Result<bool, SchedulerStoreError>;

    async fn insert_entry(&self, entry: &QueueEntry) -> Result<(), SchedulerStoreError>;

    async fn get_entry(
        &self,
        id: QueueEntryId,
    ) -> Result<Option<QueueEntry>, SchedulerStoreError>;

    /// Atomically claim the oldest due queued entry for `client`.
    ///
    /// The transition queued → running and the claimant token are written in
    /// one conditional statement; exactly one concurrent claimant can win a
    /// given row. `Err(Contention)` signals a lost race worth retrying.
    async fn claim_oldest_due(
        &self,
        now: DateTime<Utc>,
        client: &str,
    ) -> Result<Option<QueueEntry>, SchedulerStoreError>;

    /// Resolve a claimed entry: status done, resolution and message recorded.
    async fn resolve_entry(
        &self,
        id: QueueEntryId,
        resolution: EntryResolution,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerStoreError>;

    /// Force-fail running entries untouched since `cutoff`. Returns how many.
    async fn fail_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, SchedulerStoreError>;

    /// Purge done entries past their retention window. Returns how many.
    async fn purge_done_before(
        &self,
        success_cutoff: DateTime<Utc>,
        failure_cutoff: DateTime<Utc>,
    ) -> Result<u64, SchedulerStoreError>;

    /// Persisted marker of the previous cycle, for the advisory throttle.
    async fn last_cycle_at(&self) -> Result<Option<DateTime<Utc>>, SchedulerStoreError>;

    async fn record_cycle(&self, at: DateTime<Utc>) -> Result<(), SchedulerStoreError>;

    async fn entry_stats(&self) -> Result<QueueStats, SchedulerStoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, JobDefinition>,
    entries: HashMap<QueueEntryId, QueueEntry>,
    last_cycle: Option<DateTime<Utc>>,
}

/// In-memory scheduler store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySchedulerStore {
    inner: Mutex<Inner>,
}

impl InMemorySchedulerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries for a job, oldest first (test helper).
    pub fn entries_for_job(&self, job_id: JobId) -> Vec<QueueEntry> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<_> = inner
            .entries
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }
}

#[async_trait]
impl SchedulerStore for InMemorySchedulerStore {
    async fn upsert_job(&self, job: &JobDefinition) -> Result<(), SchedulerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobDefinition>, SchedulerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<JobDefinition>, SchedulerStoreError> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<_> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn set_job_last_run(
        &self,
        id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(SchedulerStoreError::JobNotFound(id))?;
        job.last_run = Some(at);
        job.modified_at = at;
        Ok(())
    }

    async fn has_pending_entry(&self, job_id: JobId) -> Result<bool, SchedulerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries
            .values()
            .any(|e| e.job_id == job_id && !e.is_done()))
    }

    async fn insert_entry(&self, entry: &QueueEntry) -> Result<(), SchedulerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_entry(
        &self,
        id: QueueEntryId,
    ) -> Result<Option<QueueEntry>, SchedulerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(&id).cloned())
    }

    async fn claim_oldest_due(
        &self,
        now: DateTime<Utc>,
        client: &str,
    ) -> Result<Option<QueueEntry>, SchedulerStoreError> {
        let mut inner = self.inner.lock().unwrap();

        let candidate = inner
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Queued && e.execute_time <= now)
            .min_by_key(|e| (e.execute_time, e.id.as_uuid().to_owned()))
            .map(|e| e.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        // Single guarded transition; the mutex stands in for the conditional
        // UPDATE the Postgres store issues.
        match inner.entries.get_mut(&id) {
            Some(entry) if entry.status == EntryStatus::Queued => {
                entry.status = EntryStatus::Running;
                entry.client = Some(client.to_string());
                entry.modified_at = now;
                Ok(Some(entry.clone()))
            }
            Some(entry) => Err(SchedulerStoreError::Contention(entry.name.clone())),
            None => Ok(None),
        }
    }

    async fn resolve_entry(
        &self,
        id: QueueEntryId,
        resolution: EntryResolution,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(SchedulerStoreError::EntryNotFound(id))?;
        entry.status = EntryStatus::Done;
        entry.resolution = resolution;
        entry.message = message.map(str::to_string);
        entry.modified_at = now;
        Ok(())
    }

    async fn fail_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, SchedulerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut failed = 0;
        for entry in inner.entries.values_mut() {
            if entry.status == EntryStatus::Running && entry.modified_at < cutoff {
                entry.status = EntryStatus::Done;
                entry.resolution = EntryResolution::Failed;
                entry.message = Some("job timed out".to_string());
                entry.modified_at = now;
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn purge_done_before(
        &self,
        success_cutoff: DateTime<Utc>,
        failure_cutoff: DateTime<Utc>,
    ) -> Result<u64, SchedulerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| {
            if !e.is_done() {
                return true;
            }
            let cutoff = if e.resolution == EntryResolution::Success {
                success_cutoff
            } else {
                failure_cutoff
            };
            e.modified_at >= cutoff
        });
        Ok((before - inner.entries.len()) as u64)
    }

    async fn last_cycle_at(&self) -> Result<Option<DateTime<Utc>>, SchedulerStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.last_cycle)
    }

    async fn record_cycle(&self, at: DateTime<Utc>) -> Result<(), SchedulerStoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.last_cycle = Some(at);
        Ok(())
    }

    async fn entry_stats(&self) -> Result<QueueStats, SchedulerStoreError> {
        let inner = self.inner.lock().unwrap();
        let mut stats = QueueStats::default();
        for entry in inner.entries.values() {
            match (entry.status, entry.resolution) {
                (EntryStatus::Queued, _) => stats.queued += 1,
                (EntryStatus::Running, _) => stats.running += 1,
                (EntryStatus::Done, EntryResolution::Success) => stats.done_success += 1,
                (EntryStatus::Done, _) => stats.done_failed += 1,
            }
        }
        Ok(stats)
    }
}
