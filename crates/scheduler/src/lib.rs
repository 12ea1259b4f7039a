//! `mailforge-scheduler` — generic cron-like job engine.
//!
//! Named job definitions fire on cron or interval rules into a relational
//! job queue; the engine claims queue entries with a conditional update,
//! runs the registered runnable, resolves the outcome, requeues retryable
//! failures, and cleans up stale and historic entries. Concurrency safety
//! across overlapping invocations comes entirely from the store's atomic
//! claim, never from in-process locking.

pub mod engine;
pub mod fire;
pub mod registry;
pub mod store;
pub mod types;

pub use engine::SchedulerEngine;
pub use fire::FireRule;
pub use registry::{JobContext, JobFailure, JobRegistry, Runnable};
pub use store::{InMemorySchedulerStore, QueueStats, SchedulerStore, SchedulerStoreError};
pub use types::{
    EntryResolution, EntryStatus, JobDefinition, JobFlag, JobReport, QueueEntry, SchedulerConfig,
};
