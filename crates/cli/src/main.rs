//! `mailforge-cron` — one scheduler cycle per invocation.
//!
//! Meant to run from crontab (typically every minute). Each invocation wires
//! the Postgres stores and the SMTP mailer, seeds the pipeline job
//! definitions if they are missing, runs one engine cycle, and prints each
//! claimed job's outcome. Exit code is 0 regardless of individual job
//! failures; only wiring/storage problems exit non-zero.

use std::sync::Arc;

use anyhow::Context;

use mailforge_core::{Clock, SystemClock};
use mailforge_delivery::{
    ProcessQueueJob, QueueEmailsJob, QueueProcessor, QueueingService, PROCESS_QUEUE_JOB,
    QUEUE_EMAILS_JOB,
};
use mailforge_infra::{
    AppConfig, PostgresCampaignLog, PostgresEmailQueueStore, PostgresMailingStore,
    PostgresSchedulerStore, PostgresTargetProvider, SmtpMailer,
};
use mailforge_scheduler::{
    FireRule, JobDefinition, JobRegistry, SchedulerEngine, SchedulerStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mailforge_observability::init();

    let config = AppConfig::from_env().context("loading configuration")?;

    let pool = mailforge_infra::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    mailforge_infra::migrate(&pool)
        .await
        .context("applying schema")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mailings = Arc::new(PostgresMailingStore::new(pool.clone()));
    let targets = Arc::new(PostgresTargetProvider::new(pool.clone()));
    let queue = Arc::new(PostgresEmailQueueStore::new(pool.clone()));
    let log = Arc::new(PostgresCampaignLog::new(pool.clone()));
    let mailer = Arc::new(SmtpMailer::new(config.smtp.clone()).context("building smtp mailer")?);

    let queueing = Arc::new(QueueingService::new(
        mailings.clone(),
        targets.clone(),
        queue.clone(),
        log.clone(),
        config.pipeline.clone(),
        clock.clone(),
    ));
    let processor = Arc::new(QueueProcessor::new(
        mailings,
        targets,
        queue,
        log,
        mailer,
        config.pipeline.clone(),
        clock.clone(),
    ));

    let mut registry = JobRegistry::new();
    registry.register(QUEUE_EMAILS_JOB, Arc::new(QueueEmailsJob::new(queueing)));
    registry.register(PROCESS_QUEUE_JOB, Arc::new(ProcessQueueJob::new(processor)));

    let store = PostgresSchedulerStore::new(pool);
    seed_pipeline_jobs(&store, &*clock).await?;

    let engine = SchedulerEngine::new(store, registry, config.scheduler, clock);
    let reports = engine.run_cycle().await.context("running cycle")?;

    for report in &reports {
        println!(
            "{}: {}",
            report.name,
            if report.ok { "ok" } else { "failed" }
        );
    }

    let stats = engine
        .store()
        .entry_stats()
        .await
        .context("reading queue stats")?;
    println!(
        "queue: {} queued, {} running, {} succeeded, {} failed",
        stats.queued, stats.running, stats.done_success, stats.done_failed
    );
    tracing::info!(jobs = reports.len(), "cycle finished");
    Ok(())
}

/// Create the two pipeline job definitions unless they already exist.
async fn seed_pipeline_jobs(
    store: &PostgresSchedulerStore,
    clock: &dyn Clock,
) -> anyhow::Result<()> {
    let existing = store.list_jobs().await.context("listing jobs")?;
    let now = clock.now();

    for name in [QUEUE_EMAILS_JOB, PROCESS_QUEUE_JOB] {
        if existing.iter().any(|job| job.name == name) {
            continue;
        }
        let rule = FireRule::every_minutes(1).context("building fire rule")?;
        let job = JobDefinition::new(name, rule, now).with_retries(2, 60);
        store.upsert_job(&job).await.context("seeding job")?;
        tracing::info!(job = name, "seeded job definition");
    }
    Ok(())
}
