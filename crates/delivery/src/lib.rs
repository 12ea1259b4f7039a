//! `mailforge-delivery` — the email queueing and delivery pipeline.
//!
//! Services and store traits for moving campaign targets through the
//! pipeline: enumeration (target provider) → validation (suppression chain +
//! duplicate gate) → durable email queue → throttled batch send with
//! retry/give-up, every outcome recorded in the append-only campaign log.
//! The queueing service and queue processor are exposed as scheduler
//! runnables in [`jobs`].

pub mod error;
pub mod jobs;
pub mod log_store;
pub mod mailer;
pub mod mailing_store;
pub mod processor;
pub mod queue_store;
pub mod queueing;
pub mod targets;

pub use error::{DeliveryStoreError, PipelineError};
pub use jobs::{ProcessQueueJob, QueueEmailsJob, PROCESS_QUEUE_JOB, QUEUE_EMAILS_JOB};
pub use log_store::{CampaignLogStore, InMemoryCampaignLog};
pub use mailer::{MailError, Mailer, MockMailer, OutboundEmail};
pub use mailing_store::{InMemoryMailingStore, MailingStore};
pub use processor::{QueueProcessor, SendReport};
pub use queue_store::{EmailQueueStore, InMemoryEmailQueueStore};
pub use queueing::{QueueingReport, QueueingService};
pub use targets::{InMemoryTargetProvider, TargetProvider};

/// Pipeline tuning knobs shared by the queueing service and the processor.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Targets evaluated / queue entries sent per mailing per cycle.
    pub batch_size: usize,
    /// Campaign-wide send policy fed into the validation chain.
    pub policy: mailforge_campaigns::SendPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            policy: mailforge_campaigns::SendPolicy::default(),
        }
    }
}
