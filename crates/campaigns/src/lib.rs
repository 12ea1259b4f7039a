//! `mailforge-campaigns` — campaign-mailing domain model.
//!
//! Pure domain types for the email-marketing pipeline: the mailing entity and
//! its validated status state machine, recipient targets, the suppression
//! lists and validation chain, the append-only campaign activity vocabulary,
//! and the durable email-queue entry.

pub mod log;
pub mod mailing;
pub mod queue;
pub mod suppression;
pub mod target;

pub use log::{Activity, CampaignLogEntry};
pub use mailing::{Mailing, MailingStatus};
pub use queue::{EmailQueueEntry, QueueKey, MAX_SEND_ATTEMPTS};
pub use suppression::{
    is_valid_email, validate_target, RejectReason, SendPolicy, SuppressionLists,
    ValidationFeedback,
};
pub use target::{Target, TargetKind, TargetRef};
