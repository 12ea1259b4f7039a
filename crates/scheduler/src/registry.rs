//! Registry of named runnables.
//!
//! The engine is agnostic to what jobs do: a claimed queue entry's job name
//! resolves here to a [`Runnable`], and the runnable's result drives the
//! entry's resolution. External collaborators (the email pipeline, cleanup
//! tasks) register themselves under their job names at wiring time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A job execution failed.
///
/// The engine treats any error from [`Runnable::run`] as that job's failure;
/// nothing a runnable returns can abort the scheduler cycle.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct JobFailure(pub String);

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Execution context handed to a runnable.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job name the runnable was registered under.
    pub job_name: String,
    /// Cycle time the entry was claimed at.
    pub now: DateTime<Utc>,
    /// Claimant token of the engine invocation.
    pub client: String,
}

/// A named unit of work the scheduler can execute.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobFailure>;
}

/// Job name → runnable lookup.
#[derive(Default)]
pub struct JobRegistry {
    runnables: HashMap<String, Arc<dyn Runnable>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, runnable: Arc<dyn Runnable>) {
        self.runnables.insert(name.into(), runnable);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Runnable>> {
        self.runnables.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.runnables.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl Runnable for Nop {
        async fn run(&self, _ctx: &JobContext) -> Result<(), JobFailure> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_name() {
        let mut registry = JobRegistry::new();
        registry.register("pipeline::queue", Arc::new(Nop));

        assert!(registry.get("pipeline::queue").is_some());
        assert!(registry.get("pipeline::send").is_none());

        let ctx = JobContext {
            job_name: "pipeline::queue".to_string(),
            now: Utc::now(),
            client: "test".to_string(),
        };
        let runnable = registry.get("pipeline::queue").unwrap();
        assert!(runnable.run(&ctx).await.is_ok());
    }
}
