//! Scheduler runnables for the pipeline services.
//!
//! The pipeline plugs into the generic job scheduler under two well-known
//! job names; wiring code registers these adapters and defines the jobs
//! with whatever fire rules the deployment wants.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use mailforge_scheduler::{JobContext, JobFailure, Runnable};

use crate::processor::QueueProcessor;
use crate::queueing::QueueingService;

/// Job name for the queue-population service.
pub const QUEUE_EMAILS_JOB: &str = "pipeline::queue_emails";
/// Job name for the queue processor.
pub const PROCESS_QUEUE_JOB: &str = "pipeline::process_queue";

/// Runs [`QueueingService::queue_emails`] as a scheduled job.
pub struct QueueEmailsJob {
    service: Arc<QueueingService>,
}

impl QueueEmailsJob {
    pub fn new(service: Arc<QueueingService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Runnable for QueueEmailsJob {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobFailure> {
        let report = self
            .service
            .queue_emails()
            .await
            .map_err(|e| JobFailure::new(e.to_string()))?;
        info!(
            job = %ctx.job_name,
            queued = report.queued,
            rejected = report.rejected,
            "queue_emails job finished"
        );
        Ok(())
    }
}

/// Runs [`QueueProcessor::process_queue`] as a scheduled job.
pub struct ProcessQueueJob {
    processor: Arc<QueueProcessor>,
}

impl ProcessQueueJob {
    pub fn new(processor: Arc<QueueProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Runnable for ProcessQueueJob {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobFailure> {
        let report = self
            .processor
            .process_queue()
            .await
            .map_err(|e| JobFailure::new(e.to_string()))?;
        info!(
            job = %ctx.job_name,
            sent = report.sent,
            gave_up = report.gave_up,
            "process_queue job finished"
        );
        Ok(())
    }
}
