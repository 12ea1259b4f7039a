//! Mailing persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailforge_campaigns::{Mailing, MailingStatus};
use mailforge_core::MailingId;

use crate::error::DeliveryStoreError;

/// Store for mailing rows and their lifecycle state.
///
/// Status writes go through the lifecycle check: an update that would move a
/// mailing backward is a [`DeliveryStoreError::Conflict`], never a silent
/// overwrite.
#[async_trait]
pub trait MailingStore: Send + Sync {
    async fn get(&self, id: MailingId) -> Result<Mailing, DeliveryStoreError>;

    /// Mailings eligible to begin or resume queueing at `now`.
    async fn list_queueing_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Mailing>, DeliveryStoreError>;

    /// Mailings whose queue entries may be sent (status queueing or sending).
    async fn list_sendable(&self) -> Result<Vec<Mailing>, DeliveryStoreError>;

    async fn set_status(
        &self,
        id: MailingId,
        to: MailingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DeliveryStoreError>;

    async fn set_queueing_finished(&self, id: MailingId) -> Result<(), DeliveryStoreError>;
}

/// In-memory mailing store for tests/dev.
#[derive(Default)]
pub struct InMemoryMailingStore {
    mailings: Mutex<HashMap<MailingId, Mailing>>,
}

impl InMemoryMailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mailing: Mailing) {
        self.mailings.lock().unwrap().insert(mailing.id, mailing);
    }
}

#[async_trait]
impl MailingStore for InMemoryMailingStore {
    async fn get(&self, id: MailingId) -> Result<Mailing, DeliveryStoreError> {
        self.mailings
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(DeliveryStoreError::NotFound)
    }

    async fn list_queueing_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Mailing>, DeliveryStoreError> {
        let mailings = self.mailings.lock().unwrap();
        let mut due: Vec<Mailing> = mailings
            .values()
            .filter(|m| m.queueing_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.send_date);
        Ok(due)
    }

    async fn list_sendable(&self) -> Result<Vec<Mailing>, DeliveryStoreError> {
        let mailings = self.mailings.lock().unwrap();
        let mut sendable: Vec<Mailing> = mailings
            .values()
            .filter(|m| matches!(m.status, MailingStatus::Queueing | MailingStatus::Sending))
            .cloned()
            .collect();
        sendable.sort_by_key(|m| m.send_date);
        Ok(sendable)
    }

    async fn set_status(
        &self,
        id: MailingId,
        to: MailingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DeliveryStoreError> {
        let mut mailings = self.mailings.lock().unwrap();
        let mailing = mailings.get_mut(&id).ok_or(DeliveryStoreError::NotFound)?;
        mailing
            .transition_to(to, now)
            .map_err(|e| DeliveryStoreError::Conflict(e.to_string()))
    }

    async fn set_queueing_finished(&self, id: MailingId) -> Result<(), DeliveryStoreError> {
        let mut mailings = self.mailings.lock().unwrap();
        let mailing = mailings.get_mut(&id).ok_or(DeliveryStoreError::NotFound)?;
        mailing.queueing_finished = true;
        Ok(())
    }
}
