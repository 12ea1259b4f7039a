//! Environment-driven runtime configuration.

use std::env;

use chrono::Duration;
use thiserror::Error;

use mailforge_campaigns::SendPolicy;
use mailforge_delivery::PipelineConfig;
use mailforge_scheduler::SchedulerConfig;

use crate::smtp::SmtpConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} is not a valid {expected}: {value}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Everything the cron binary needs, mapped from the process environment.
///
/// Scheduler knobs fall back to their defaults when unset; only the database
/// URL and the SMTP variables that `SmtpConfig` requires are mandatory.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub scheduler: SchedulerConfig,
    pub pipeline: PipelineConfig,
    pub smtp: SmtpConfig,
}

impl AppConfig {
    /// Load configuration from `MAILFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("MAILFORGE_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::Missing("MAILFORGE_DATABASE_URL"))?;

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            max_jobs: parse_var("MAILFORGE_MAX_JOBS", defaults.max_jobs)?,
            max_runtime: seconds_var("MAILFORGE_MAX_RUNTIME_SECS", defaults.max_runtime)?,
            min_cycle_interval: seconds_var(
                "MAILFORGE_MIN_CYCLE_INTERVAL_SECS",
                defaults.min_cycle_interval,
            )?,
            job_tries: parse_var("MAILFORGE_JOB_TRIES", defaults.job_tries)?,
            success_lifetime: seconds_var(
                "MAILFORGE_SUCCESS_LIFETIME_SECS",
                defaults.success_lifetime,
            )?,
            failure_lifetime: seconds_var(
                "MAILFORGE_FAILURE_LIFETIME_SECS",
                defaults.failure_lifetime,
            )?,
            stale_timeout: seconds_var("MAILFORGE_STALE_TIMEOUT_SECS", defaults.stale_timeout)?,
            min_requeue_interval: seconds_var(
                "MAILFORGE_MIN_REQUEUE_INTERVAL_SECS",
                defaults.min_requeue_interval,
            )?,
        };

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            batch_size: parse_var("MAILFORGE_EMAIL_BATCH_SIZE", pipeline_defaults.batch_size)?,
            policy: SendPolicy {
                require_opt_in: flag_var("MAILFORGE_REQUIRE_OPT_IN", false),
            },
        };

        let smtp = SmtpConfig::from_env()?;

        Ok(Self {
            database_url,
            scheduler,
            pipeline,
            smtp,
        })
    }
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            expected: "number",
            value: raw,
        }),
    }
}

fn seconds_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::seconds(parse_var(
        name,
        default.num_seconds(),
    )?))
}

fn flag_var(name: &'static str, default: bool) -> bool {
    env::var(name)
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(default)
}
