//! Delivery-layer errors.

use thiserror::Error;

use mailforge_core::DomainError;

/// Error from any delivery store (mailings, email queue, log, targets).
#[derive(Debug, Clone, Error)]
pub enum DeliveryStoreError {
    #[error("not found")]
    NotFound,
    /// A uniqueness or state-machine condition was violated.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Error surfaced by the queueing service or queue processor.
///
/// These abort the failing mailing only; sibling mailings in the same cycle
/// are processed regardless. Per-target problems (validation, transport)
/// never surface here — they end in the campaign log.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] DeliveryStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}
