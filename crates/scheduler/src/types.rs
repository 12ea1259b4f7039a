//! Job definitions, queue entries, and engine configuration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use mailforge_core::{JobId, QueueEntryId};

use crate::fire::FireRule;

/// Whether a job definition participates in scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFlag {
    Active,
    Inactive,
}

impl JobFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobFlag::Active => "active",
            JobFlag::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(JobFlag::Active),
            "inactive" => Some(JobFlag::Inactive),
            _ => None,
        }
    }
}

/// A named, recurring unit of work.
///
/// `name` is the opaque key runnables register under; the definition is
/// mutated on each successful fire to record `last_run` and is never
/// hard-deleted during normal operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobId,
    pub name: String,
    pub flag: JobFlag,
    pub rule: FireRule,
    pub last_run: Option<DateTime<Utc>>,
    /// Create a fresh queue entry on failure while budget remains.
    pub requeue: bool,
    /// Retry budget granted to each fired queue entry.
    pub retry_count: u32,
    /// Minimum delay before a requeued entry becomes due, in seconds.
    pub job_delay_secs: u32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, rule: FireRule, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            flag: JobFlag::Active,
            rule,
            last_run: None,
            requeue: false,
            retry_count: 0,
            job_delay_secs: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_retries(mut self, retry_count: u32, job_delay_secs: u32) -> Self {
        self.requeue = true;
        self.retry_count = retry_count;
        self.job_delay_secs = job_delay_secs;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.flag == JobFlag::Active && self.rule.is_due(now, self.last_run)
    }
}

/// Queue entry status: where the entry is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Queued,
    Running,
    Done,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Queued => "queued",
            EntryStatus::Running => "running",
            EntryStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(EntryStatus::Queued),
            "running" => Some(EntryStatus::Running),
            "done" => Some(EntryStatus::Done),
            _ => None,
        }
    }
}

/// How a done entry ended (still `Queued` while undecided).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryResolution {
    Queued,
    Success,
    Failed,
}

impl EntryResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryResolution::Queued => "queued",
            EntryResolution::Success => "success",
            EntryResolution::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(EntryResolution::Queued),
            "success" => Some(EntryResolution::Success),
            "failed" => Some(EntryResolution::Failed),
            _ => None,
        }
    }
}

/// One pending/running/done execution of a job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub job_id: JobId,
    /// Deterministic display name: `"{job name} - {execute time}"`.
    pub name: String,
    pub status: EntryStatus,
    pub resolution: EntryResolution,
    pub execute_time: DateTime<Utc>,
    /// Claimant token recorded by the conditional claim update.
    pub client: Option<String>,
    /// Remaining retry budget.
    pub retry_count: u32,
    /// Failures accumulated across requeues of this fire.
    pub failure_count: u32,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Materialize a fired entry for `job`, due at `execute_time`.
    pub fn for_job(job: &JobDefinition, execute_time: DateTime<Utc>) -> Self {
        Self {
            id: QueueEntryId::new(),
            job_id: job.id,
            name: format!("{} - {}", job.name, execute_time.format("%Y-%m-%d %H:%M:%S")),
            status: EntryStatus::Queued,
            resolution: EntryResolution::Queued,
            execute_time,
            client: None,
            retry_count: job.retry_count,
            failure_count: 0,
            message: None,
            created_at: execute_time,
            modified_at: execute_time,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == EntryStatus::Done
    }
}

/// Per-cycle outcome for one claimed job, as reported to the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub name: String,
    pub ok: bool,
}

/// Engine tuning knobs; see `mailforge-infra` for the environment mapping.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Most jobs one cycle will claim and run.
    pub max_jobs: usize,
    /// Wall-clock budget for the claim-and-run loop, checked between
    /// iterations (cooperative, never preemptive).
    pub max_runtime: Duration,
    /// Advisory minimum spacing between cycles.
    pub min_cycle_interval: Duration,
    /// Claim attempts per iteration before giving up on contention.
    pub job_tries: u32,
    /// How long successful done entries are retained.
    pub success_lifetime: Duration,
    /// How long failed done entries are retained.
    pub failure_lifetime: Duration,
    /// A running entry untouched for this long is considered crashed.
    pub stale_timeout: Duration,
    /// Floor for the requeue delay of failed jobs.
    pub min_requeue_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 25,
            max_runtime: Duration::seconds(300),
            min_cycle_interval: Duration::seconds(30),
            job_tries: 5,
            success_lifetime: Duration::days(7),
            failure_lifetime: Duration::days(30),
            stale_timeout: Duration::hours(1),
            min_requeue_interval: Duration::seconds(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fired_entry_carries_job_budget_and_deterministic_name() {
        let now = Utc::now();
        let job = JobDefinition::new("pipeline::send", FireRule::every_minutes(5).unwrap(), now)
            .with_retries(3, 60);

        let entry = QueueEntry::for_job(&job, now);
        assert_eq!(entry.job_id, job.id);
        assert_eq!(entry.retry_count, 3);
        assert_eq!(entry.status, EntryStatus::Queued);
        assert_eq!(entry.resolution, EntryResolution::Queued);
        assert_eq!(
            entry.name,
            format!("pipeline::send - {}", now.format("%Y-%m-%d %H:%M:%S"))
        );
    }

    #[test]
    fn inactive_jobs_are_never_due() {
        let now = Utc::now();
        let mut job = JobDefinition::new("idle", FireRule::every_minutes(1).unwrap(), now);
        assert!(job.is_due(now));

        job.flag = JobFlag::Inactive;
        assert!(!job.is_due(now));
    }
}
