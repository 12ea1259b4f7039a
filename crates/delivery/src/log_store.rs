//! Campaign log persistence.

use std::sync::Mutex;

use async_trait::async_trait;

use mailforge_campaigns::{Activity, CampaignLogEntry};
use mailforge_core::{CampaignId, MailingId, TargetId};

use crate::error::DeliveryStoreError;

/// Append-only store for the campaign delivery ledger.
#[async_trait]
pub trait CampaignLogStore: Send + Sync {
    async fn append(&self, entry: CampaignLogEntry) -> Result<(), DeliveryStoreError>;

    async fn for_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<CampaignLogEntry>, DeliveryStoreError>;

    /// Whether the ledger already records `activity` for this target under
    /// this mailing. The queueing gate uses it to keep a target from being
    /// sent to twice after its queue row is gone.
    async fn has_activity(
        &self,
        mailing_id: MailingId,
        target_id: TargetId,
        activity: Activity,
    ) -> Result<bool, DeliveryStoreError>;
}

/// In-memory log for tests/dev.
#[derive(Default)]
pub struct InMemoryCampaignLog {
    entries: Mutex<Vec<CampaignLogEntry>>,
}

impl InMemoryCampaignLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activity labels for a campaign, in append order. Test helper.
    pub fn labels(&self, campaign_id: CampaignId) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.campaign_id == campaign_id)
            .map(|e| e.activity.label())
            .collect()
    }
}

#[async_trait]
impl CampaignLogStore for InMemoryCampaignLog {
    async fn append(&self, entry: CampaignLogEntry) -> Result<(), DeliveryStoreError> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    async fn for_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<CampaignLogEntry>, DeliveryStoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn has_activity(
        &self,
        mailing_id: MailingId,
        target_id: TargetId,
        activity: Activity,
    ) -> Result<bool, DeliveryStoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| {
                e.mailing_id == mailing_id && e.target_id == target_id && e.activity == activity
            }))
    }
}
