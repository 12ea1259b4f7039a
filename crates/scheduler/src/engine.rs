//! The scheduler cycle: cleanup, fire, claim, run, resolve.

use std::cmp::max;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use mailforge_core::Clock;

use crate::registry::{JobContext, JobRegistry};
use crate::store::{SchedulerStore, SchedulerStoreError};
use crate::types::{EntryResolution, JobDefinition, JobReport, QueueEntry, SchedulerConfig};

/// Drives one scheduler cycle over a store and a registry.
///
/// Intended to be constructed and invoked once per cron/CLI invocation;
/// nothing here assumes it is the only engine running, and all coordination
/// with concurrent invocations goes through the store.
pub struct SchedulerEngine<S> {
    store: S,
    registry: JobRegistry,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
}

impl<S: SchedulerStore> SchedulerEngine<S> {
    pub fn new(
        store: S,
        registry: JobRegistry,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one full cycle and report each claimed job's outcome.
    ///
    /// Individual job failures never abort the cycle; it ends early only on
    /// the wall-clock deadline or after `max_jobs` claims.
    #[instrument(skip(self), fields(client))]
    pub async fn run_cycle(&self) -> Result<Vec<JobReport>, SchedulerStoreError> {
        let now = self.clock.now();

        // Advisory throttle: warn when cycles overlap faster than the
        // configured spacing, but keep going and record the attempt.
        if let Some(last) = self.store.last_cycle_at().await? {
            let elapsed = now - last;
            if elapsed < self.config.min_cycle_interval {
                warn!(
                    elapsed_secs = elapsed.num_seconds(),
                    min_secs = self.config.min_cycle_interval.num_seconds(),
                    "cycle started under the throttle interval; continuing"
                );
            }
        }
        self.store.record_cycle(now).await?;

        let stale = self
            .store
            .fail_stale_running(now - self.config.stale_timeout, now)
            .await?;
        if stale > 0 {
            warn!(stale, "force-failed stale running entries");
        }

        let purged = self
            .store
            .purge_done_before(
                now - self.config.success_lifetime,
                now - self.config.failure_lifetime,
            )
            .await?;
        if purged > 0 {
            debug!(purged, "purged historic queue entries");
        }

        self.fire_due_jobs().await?;
        self.claim_and_run().await
    }

    /// Materialize queue entries for due job definitions.
    ///
    /// The existence check is the mutual-exclusion invariant: a job with any
    /// non-done entry must not fire a second one.
    async fn fire_due_jobs(&self) -> Result<(), SchedulerStoreError> {
        let now = self.clock.now();
        for job in self.store.list_jobs().await? {
            if !job.is_due(now) {
                continue;
            }
            if self.store.has_pending_entry(job.id).await? {
                debug!(job = %job.name, "due job already has a pending entry");
                continue;
            }
            let entry = QueueEntry::for_job(&job, now);
            debug!(job = %job.name, entry = %entry.name, "fired job");
            self.store.insert_entry(&entry).await?;
        }
        Ok(())
    }

    async fn claim_and_run(&self) -> Result<Vec<JobReport>, SchedulerStoreError> {
        let client = format!("sched:{}", Uuid::now_v7());
        tracing::Span::current().record("client", client.as_str());

        let deadline = self.clock.now() + self.config.max_runtime;
        let mut reports = Vec::new();

        while reports.len() < self.config.max_jobs {
            let now = self.clock.now();
            if now >= deadline {
                info!(ran = reports.len(), "cycle hit the runtime cutoff");
                break;
            }

            let Some(entry) = self.claim_with_retry(&client).await? else {
                break;
            };
            let ok = self.run_entry(&entry, &client).await?;
            reports.push(JobReport {
                name: entry.name.clone(),
                ok,
            });
        }

        Ok(reports)
    }

    /// Claim the oldest due entry, retrying lost races up to `job_tries`.
    async fn claim_with_retry(
        &self,
        client: &str,
    ) -> Result<Option<QueueEntry>, SchedulerStoreError> {
        for attempt in 1..=self.config.job_tries {
            match self.store.claim_oldest_due(self.clock.now(), client).await {
                Ok(claimed) => return Ok(claimed),
                Err(SchedulerStoreError::Contention(name)) => {
                    debug!(entry = %name, attempt, "lost claim race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(tries = self.config.job_tries, "claim contention exhausted");
        Ok(None)
    }

    /// Execute one claimed entry and resolve it.
    async fn run_entry(
        &self,
        entry: &QueueEntry,
        client: &str,
    ) -> Result<bool, SchedulerStoreError> {
        let Some(job) = self.store.get_job(entry.job_id).await? else {
            self.store
                .resolve_entry(
                    entry.id,
                    EntryResolution::Failed,
                    Some("job definition missing"),
                    self.clock.now(),
                )
                .await?;
            return Ok(false);
        };

        let Some(runnable) = self.registry.get(&job.name) else {
            warn!(job = %job.name, "no runnable registered for claimed job");
            self.store
                .resolve_entry(
                    entry.id,
                    EntryResolution::Failed,
                    Some("no runnable registered"),
                    self.clock.now(),
                )
                .await?;
            return Ok(false);
        };

        let ctx = JobContext {
            job_name: job.name.clone(),
            now: self.clock.now(),
            client: client.to_string(),
        };

        // A panic inside a runnable must not unwind through the cycle: run
        // it on its own task so the panic surfaces as a join error, and
        // resolve the entry failed like any other job error.
        let task = tokio::spawn(async move { runnable.run(&ctx).await });

        match task.await {
            Ok(Ok(())) => {
                let now = self.clock.now();
                self.store
                    .resolve_entry(entry.id, EntryResolution::Success, None, now)
                    .await?;
                self.store.set_job_last_run(job.id, now).await?;
                debug!(job = %job.name, "job succeeded");
                Ok(true)
            }
            Ok(Err(failure)) => {
                warn!(job = %job.name, error = %failure, "job failed");
                self.resolve_failure(&job, entry, &failure.0).await?;
                Ok(false)
            }
            Err(join) => {
                let message = if join.is_panic() {
                    "job panicked"
                } else {
                    "job task cancelled"
                };
                warn!(job = %job.name, error = %join, "job aborted");
                self.resolve_failure(&job, entry, message).await?;
                Ok(false)
            }
        }
    }

    /// Record a failure and requeue while the retry budget allows.
    async fn resolve_failure(
        &self,
        job: &JobDefinition,
        entry: &QueueEntry,
        message: &str,
    ) -> Result<(), SchedulerStoreError> {
        let now = self.clock.now();
        self.store
            .resolve_entry(entry.id, EntryResolution::Failed, Some(message), now)
            .await?;

        if job.requeue && entry.retry_count > 0 {
            let delay = max(
                Duration::seconds(i64::from(job.job_delay_secs)),
                self.config.min_requeue_interval,
            );
            let mut retry = QueueEntry::for_job(job, now + delay);
            retry.retry_count = entry.retry_count - 1;
            retry.failure_count = entry.failure_count + 1;
            debug!(
                job = %job.name,
                remaining = retry.retry_count,
                execute_time = %retry.execute_time,
                "requeued failed job"
            );
            self.store.insert_entry(&retry).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fire::FireRule;
    use crate::registry::{JobFailure, Runnable};
    use crate::store::InMemorySchedulerStore;
    use crate::types::{EntryStatus, JobFlag};
    use async_trait::async_trait;
    use chrono::Utc;
    use mailforge_core::FixedClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Succeed;

    #[async_trait]
    impl Runnable for Succeed {
        async fn run(&self, _ctx: &JobContext) -> Result<(), JobFailure> {
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl Runnable for Fail {
        async fn run(&self, _ctx: &JobContext) -> Result<(), JobFailure> {
            Err(JobFailure::new("exploded"))
        }
    }

    struct Blowup;

    #[async_trait]
    impl Runnable for Blowup {
        async fn run(&self, _ctx: &JobContext) -> Result<(), JobFailure> {
            panic!("runnable blew up")
        }
    }

    struct Counting(AtomicU32);

    #[async_trait]
    impl Runnable for Counting {
        async fn run(&self, _ctx: &JobContext) -> Result<(), JobFailure> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine(
        registry: JobRegistry,
        config: SchedulerConfig,
        clock: FixedClock,
    ) -> SchedulerEngine<InMemorySchedulerStore> {
        SchedulerEngine::new(
            InMemorySchedulerStore::new(),
            registry,
            config,
            Arc::new(clock),
        )
    }

    #[tokio::test]
    async fn due_interval_job_fires_runs_and_updates_last_run() {
        let now = Utc::now();
        let clock = FixedClock::at(now);
        let mut registry = JobRegistry::new();
        registry.register("test::tick", Arc::new(Succeed));
        let engine = engine(registry, SchedulerConfig::default(), clock);

        let mut job = JobDefinition::new(
            "test::tick",
            FireRule::every_minutes(5).unwrap(),
            now - Duration::hours(1),
        );
        job.last_run = Some(now - Duration::minutes(10));
        engine.store().upsert_job(&job).await.unwrap();

        let reports = engine.run_cycle().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].ok);

        let entries = engine.store().entries_for_job(job.id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Done);
        assert_eq!(entries[0].resolution, EntryResolution::Success);

        let job = engine.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.last_run, Some(now));
    }

    #[tokio::test]
    async fn pending_entry_blocks_a_second_fire() {
        let now = Utc::now();
        let clock = FixedClock::at(now);
        let engine = engine(JobRegistry::new(), SchedulerConfig::default(), clock);

        let job = JobDefinition::new("test::tick", FireRule::every_minutes(5).unwrap(), now);
        engine.store().upsert_job(&job).await.unwrap();

        // Existing pending entry, not yet due, so the claim loop ignores it.
        let pending = QueueEntry::for_job(&job, now + Duration::hours(1));
        engine.store().insert_entry(&pending).await.unwrap();

        let reports = engine.run_cycle().await.unwrap();
        assert!(reports.is_empty());
        assert_eq!(engine.store().entries_for_job(job.id).len(), 1);
    }

    #[tokio::test]
    async fn inactive_jobs_do_not_fire() {
        let now = Utc::now();
        let engine = engine(
            JobRegistry::new(),
            SchedulerConfig::default(),
            FixedClock::at(now),
        );

        let mut job = JobDefinition::new("test::off", FireRule::every_minutes(1).unwrap(), now);
        job.flag = JobFlag::Inactive;
        engine.store().upsert_job(&job).await.unwrap();

        engine.run_cycle().await.unwrap();
        assert!(engine.store().entries_for_job(job.id).is_empty());
    }

    #[tokio::test]
    async fn failure_requeues_until_the_budget_is_spent() {
        let now = Utc::now();
        let clock = FixedClock::at(now);
        let mut registry = JobRegistry::new();
        registry.register("test::flaky", Arc::new(Fail));
        let mut config = SchedulerConfig::default();
        config.min_requeue_interval = Duration::seconds(30);
        let engine = engine(registry, config, clock.clone());

        let job = JobDefinition::new("test::flaky", FireRule::every_minutes(60).unwrap(), now)
            .with_retries(2, 0);
        engine.store().upsert_job(&job).await.unwrap();

        // First fire: fails, requeues with one retry left at now + 30s.
        let reports = engine.run_cycle().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].ok);

        let entries = engine.store().entries_for_job(job.id);
        assert_eq!(entries.len(), 2);
        let retry = entries.last().unwrap();
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.failure_count, 1);
        assert_eq!(retry.execute_time, now + Duration::seconds(30));

        // Second failure: budget drops to zero.
        clock.advance(Duration::minutes(1));
        engine.run_cycle().await.unwrap();
        let entries = engine.store().entries_for_job(job.id);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.last().unwrap().retry_count, 0);

        // Third failure: no budget left, terminally failed, no new entry.
        clock.advance(Duration::minutes(1));
        engine.run_cycle().await.unwrap();
        let entries = engine.store().entries_for_job(job.id);
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.is_done()));
        assert!(entries
            .iter()
            .all(|e| e.resolution == EntryResolution::Failed));
    }

    #[tokio::test]
    async fn max_jobs_bounds_the_claim_loop() {
        let now = Utc::now();
        let mut registry = JobRegistry::new();
        let counter = Arc::new(Counting(AtomicU32::new(0)));
        for name in ["test::a", "test::b", "test::c"] {
            registry.register(name, counter.clone());
        }
        let mut config = SchedulerConfig::default();
        config.max_jobs = 2;
        let engine = engine(registry, config, FixedClock::at(now));

        for name in ["test::a", "test::b", "test::c"] {
            let job = JobDefinition::new(name, FireRule::every_minutes(5).unwrap(), now);
            engine.store().upsert_job(&job).await.unwrap();
        }

        let reports = engine.run_cycle().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        let stats = engine.store().entry_stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.done_success, 2);
    }

    #[tokio::test]
    async fn zero_runtime_budget_skips_the_claim_loop() {
        let now = Utc::now();
        let mut registry = JobRegistry::new();
        registry.register("test::tick", Arc::new(Succeed));
        let mut config = SchedulerConfig::default();
        config.max_runtime = Duration::zero();
        let engine = engine(registry, config, FixedClock::at(now));

        let job = JobDefinition::new("test::tick", FireRule::every_minutes(5).unwrap(), now);
        engine.store().upsert_job(&job).await.unwrap();

        let reports = engine.run_cycle().await.unwrap();
        // Fired but never claimed: the cutoff is checked before each claim.
        assert!(reports.is_empty());
        let stats = engine.store().entry_stats().await.unwrap();
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn unregistered_job_resolves_failed_without_aborting() {
        let now = Utc::now();
        let mut registry = JobRegistry::new();
        registry.register("test::known", Arc::new(Succeed));
        let engine = engine(registry, SchedulerConfig::default(), FixedClock::at(now));

        let ghost = JobDefinition::new("test::ghost", FireRule::every_minutes(5).unwrap(), now);
        let known = JobDefinition::new("test::known", FireRule::every_minutes(5).unwrap(), now);
        engine.store().upsert_job(&ghost).await.unwrap();
        engine.store().upsert_job(&known).await.unwrap();

        let reports = engine.run_cycle().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports.iter().filter(|r| r.ok).count(), 1);

        let entries = engine.store().entries_for_job(ghost.id);
        assert_eq!(entries[0].resolution, EntryResolution::Failed);
        assert_eq!(entries[0].message.as_deref(), Some("no runnable registered"));
    }

    #[tokio::test]
    async fn panicking_runnable_fails_its_entry_and_the_cycle_continues() {
        let now = Utc::now();
        let mut registry = JobRegistry::new();
        registry.register("test::boom", Arc::new(Blowup));
        registry.register("test::tick", Arc::new(Succeed));
        let engine = engine(registry, SchedulerConfig::default(), FixedClock::at(now));

        let boom = JobDefinition::new("test::boom", FireRule::every_minutes(5).unwrap(), now);
        let tick = JobDefinition::new("test::tick", FireRule::every_minutes(5).unwrap(), now);
        engine.store().upsert_job(&boom).await.unwrap();
        engine.store().upsert_job(&tick).await.unwrap();

        // Both claimed entries get a report; the panic is confined to its job.
        let reports = engine.run_cycle().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports.iter().filter(|r| r.ok).count(), 1);

        let entries = engine.store().entries_for_job(boom.id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Done);
        assert_eq!(entries[0].resolution, EntryResolution::Failed);
        assert_eq!(entries[0].message.as_deref(), Some("job panicked"));
    }

    #[tokio::test]
    async fn throttle_is_advisory() {
        let now = Utc::now();
        let clock = FixedClock::at(now);
        let mut registry = JobRegistry::new();
        registry.register("test::tick", Arc::new(Succeed));
        let engine = engine(registry, SchedulerConfig::default(), clock.clone());

        let job = JobDefinition::new("test::tick", FireRule::every_minutes(1).unwrap(), now);
        engine.store().upsert_job(&job).await.unwrap();
        engine.run_cycle().await.unwrap();

        // Immediately run another cycle, well under the throttle interval:
        // it still claims and runs due work.
        clock.advance(Duration::minutes(2));
        let reports = engine.run_cycle().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].ok);
    }

    #[tokio::test]
    async fn stale_running_entries_are_recovered_by_the_next_cycle() {
        let now = Utc::now();
        let clock = FixedClock::at(now);
        let engine = engine(JobRegistry::new(), SchedulerConfig::default(), clock.clone());

        let job = JobDefinition::new("test::hung", FireRule::every_minutes(60).unwrap(), now);
        engine.store().upsert_job(&job).await.unwrap();
        let entry = QueueEntry::for_job(&job, now);
        engine.store().insert_entry(&entry).await.unwrap();
        engine
            .store()
            .claim_oldest_due(now, "crashed-run")
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::hours(2));
        engine.run_cycle().await.unwrap();

        let entry = engine.store().get_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Done);
        assert_eq!(entry.resolution, EntryResolution::Failed);
    }
}
