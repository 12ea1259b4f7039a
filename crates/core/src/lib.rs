//! `mailforge-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! typed identifiers, the domain error model, the clock abstraction used in
//! place of ambient wall-clock reads, and the field-map `Record` type used at
//! the data-access boundary.

pub mod clock;
pub mod error;
pub mod id;
pub mod record;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{
    AccountId, CampaignId, EmailEntryId, JobId, ListId, MailingId, QueueEntryId, TargetId,
};
pub use record::Record;
