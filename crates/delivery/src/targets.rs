//! Target enumeration and suppression-state source.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use mailforge_campaigns::{SuppressionLists, TargetKind, TargetRef};
use mailforge_core::{CampaignId, Record, TargetId};

use crate::error::DeliveryStoreError;

/// Resolves the addressable recipients of a campaign.
///
/// Flattens prospect-list membership, direct user assignment, and static
/// address lists into a single target set, and owns the "not yet evaluated"
/// bookkeeping that lets queueing resume across scheduler ticks. Also the
/// source of the campaign's suppression state, derived from its exempt
/// lists at call time.
#[async_trait]
pub trait TargetProvider: Send + Sync {
    /// Next batch of not-yet-evaluated targets, bounded by `batch`.
    ///
    /// Membership links marked deleted are never returned.
    async fn next_targets(
        &self,
        campaign_id: CampaignId,
        batch: usize,
    ) -> Result<Vec<TargetRef>, DeliveryStoreError>;

    /// How many targets remain to evaluate; zero means queueing can finish.
    async fn remaining(&self, campaign_id: CampaignId) -> Result<u64, DeliveryStoreError>;

    /// Record that a target was evaluated (queued or rejected), removing it
    /// from the "not yet queued" set.
    async fn mark_evaluated(
        &self,
        campaign_id: CampaignId,
        target_id: TargetId,
    ) -> Result<(), DeliveryStoreError>;

    /// Full record for a target, from the record-provider boundary.
    async fn load(
        &self,
        kind: TargetKind,
        target_id: TargetId,
    ) -> Result<Option<Record>, DeliveryStoreError>;

    /// Current suppression state for the campaign's exempt lists.
    async fn suppression(
        &self,
        campaign_id: CampaignId,
    ) -> Result<SuppressionLists, DeliveryStoreError>;
}

#[derive(Debug, Clone)]
struct Membership {
    reference: TargetRef,
    evaluated: bool,
    deleted: bool,
}

#[derive(Default)]
struct Inner {
    memberships: HashMap<CampaignId, Vec<Membership>>,
    records: HashMap<TargetId, Record>,
    suppression: HashMap<CampaignId, SuppressionLists>,
}

/// In-memory target provider for tests/dev.
#[derive(Default)]
pub struct InMemoryTargetProvider {
    inner: Mutex<Inner>,
}

impl InMemoryTargetProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one target with its backing record.
    pub fn seed_target(&self, campaign_id: CampaignId, reference: TargetRef, record: Record) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.insert(reference.target_id, record);
        inner
            .memberships
            .entry(campaign_id)
            .or_default()
            .push(Membership {
                reference,
                evaluated: false,
                deleted: false,
            });
    }

    /// Mark a membership link deleted (excluded from enumeration).
    pub fn delete_membership(&self, campaign_id: CampaignId, target_id: TargetId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(memberships) = inner.memberships.get_mut(&campaign_id) {
            for membership in memberships {
                if membership.reference.target_id == target_id {
                    membership.deleted = true;
                }
            }
        }
    }

    pub fn set_suppression(&self, campaign_id: CampaignId, lists: SuppressionLists) {
        let mut inner = self.inner.lock().unwrap();
        inner.suppression.insert(campaign_id, lists);
    }
}

#[async_trait]
impl TargetProvider for InMemoryTargetProvider {
    async fn next_targets(
        &self,
        campaign_id: CampaignId,
        batch: usize,
    ) -> Result<Vec<TargetRef>, DeliveryStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .memberships
            .get(&campaign_id)
            .map(|memberships| {
                memberships
                    .iter()
                    .filter(|m| !m.evaluated && !m.deleted)
                    .take(batch)
                    .map(|m| m.reference)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remaining(&self, campaign_id: CampaignId) -> Result<u64, DeliveryStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .memberships
            .get(&campaign_id)
            .map(|memberships| {
                memberships
                    .iter()
                    .filter(|m| !m.evaluated && !m.deleted)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn mark_evaluated(
        &self,
        campaign_id: CampaignId,
        target_id: TargetId,
    ) -> Result<(), DeliveryStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let memberships = inner
            .memberships
            .get_mut(&campaign_id)
            .ok_or(DeliveryStoreError::NotFound)?;
        for membership in memberships {
            if membership.reference.target_id == target_id {
                membership.evaluated = true;
            }
        }
        Ok(())
    }

    async fn load(
        &self,
        _kind: TargetKind,
        target_id: TargetId,
    ) -> Result<Option<Record>, DeliveryStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.get(&target_id).cloned())
    }

    async fn suppression(
        &self,
        campaign_id: CampaignId,
    ) -> Result<SuppressionLists, DeliveryStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .suppression
            .get(&campaign_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(kind: TargetKind) -> TargetRef {
        TargetRef {
            target_id: TargetId::new(),
            kind,
            list_id: None,
        }
    }

    fn record(id: &TargetId, email: &str) -> Record {
        Record::new("contacts", id.to_string()).with("email", email)
    }

    #[tokio::test]
    async fn enumeration_is_bounded_and_consumable() {
        let provider = InMemoryTargetProvider::new();
        let campaign = CampaignId::new();

        for i in 0..3 {
            let r = reference(TargetKind::Contact);
            provider.seed_target(campaign, r, record(&r.target_id, &format!("t{i}@x.org")));
        }

        let batch = provider.next_targets(campaign, 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(provider.remaining(campaign).await.unwrap(), 3);

        for target in &batch {
            provider
                .mark_evaluated(campaign, target.target_id)
                .await
                .unwrap();
        }
        assert_eq!(provider.remaining(campaign).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deleted_membership_links_are_excluded() {
        let provider = InMemoryTargetProvider::new();
        let campaign = CampaignId::new();

        let kept = reference(TargetKind::Prospect);
        let dropped = reference(TargetKind::Prospect);
        provider.seed_target(campaign, kept, record(&kept.target_id, "kept@x.org"));
        provider.seed_target(campaign, dropped, record(&dropped.target_id, "gone@x.org"));
        provider.delete_membership(campaign, dropped.target_id);

        let batch = provider.next_targets(campaign, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].target_id, kept.target_id);
        assert_eq!(provider.remaining(campaign).await.unwrap(), 1);
    }
}
