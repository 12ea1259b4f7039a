//! `mailforge-infra` — Postgres stores, SMTP transport, and configuration.
//!
//! Implements the store traits from `mailforge-scheduler` and
//! `mailforge-delivery` over SQLx/Postgres, provides the lettre-backed
//! [`SmtpMailer`], and maps the process environment onto the runtime
//! configuration. Concurrency-sensitive writes (job claims, email-queue
//! marking) are single conditional statements so overlapping cron
//! invocations coordinate purely through the database.

pub mod config;
pub mod db;
pub mod log_store;
pub mod mailing_store;
pub mod queue_store;
pub mod scheduler_store;
pub mod smtp;
pub mod targets;

pub use config::AppConfig;
pub use db::{connect, migrate};
pub use log_store::PostgresCampaignLog;
pub use mailing_store::PostgresMailingStore;
pub use queue_store::PostgresEmailQueueStore;
pub use scheduler_store::PostgresSchedulerStore;
pub use smtp::{SmtpConfig, SmtpMailer};
pub use targets::PostgresTargetProvider;
