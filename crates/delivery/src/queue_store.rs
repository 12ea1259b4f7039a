//! Email delivery queue persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use mailforge_campaigns::{EmailQueueEntry, QueueKey};
use mailforge_core::{EmailEntryId, MailingId};

use crate::error::DeliveryStoreError;

/// Store for per-recipient queue rows.
///
/// Uniqueness is the store's job: at most one live (non-deleted) row per
/// [`QueueKey`], enforced at insert so concurrent queueing runs cannot
/// double-enlist a target.
#[async_trait]
pub trait EmailQueueStore: Send + Sync {
    /// Insert an entry unless a live row with the same key exists.
    ///
    /// Returns whether the entry was inserted; `false` means a duplicate.
    async fn add(&self, entry: EmailQueueEntry) -> Result<bool, DeliveryStoreError>;

    async fn get(&self, id: EmailEntryId) -> Result<EmailQueueEntry, DeliveryStoreError>;

    /// Claim up to `limit` due entries of a mailing for this processor run.
    ///
    /// Claimed entries are marked `in_queue` at `now`; entries claimed by a
    /// run inside the claim window are skipped.
    async fn claim_due(
        &self,
        mailing_id: MailingId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmailQueueEntry>, DeliveryStoreError>;

    /// Soft-delete the live row for `key` (sent, or given up).
    async fn delete(&self, key: QueueKey) -> Result<(), DeliveryStoreError>;

    /// Record a failed send attempt and release the claim so the next cycle
    /// retries the entry. Returns the new attempt count.
    async fn bump_send_attempts(
        &self,
        id: EmailEntryId,
        now: DateTime<Utc>,
    ) -> Result<u32, DeliveryStoreError>;

    /// Live rows remaining for a mailing.
    async fn pending_count(&self, mailing_id: MailingId) -> Result<u64, DeliveryStoreError>;
}

/// In-memory queue store for tests/dev.
pub struct InMemoryEmailQueueStore {
    entries: Mutex<HashMap<EmailEntryId, EmailQueueEntry>>,
    claim_window: Duration,
}

impl Default for InMemoryEmailQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEmailQueueStore {
    /// Claims older than 24h are treated as abandoned.
    pub fn new() -> Self {
        Self::with_claim_window(Duration::hours(24))
    }

    pub fn with_claim_window(claim_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            claim_window,
        }
    }

    fn live_key_exists(entries: &HashMap<EmailEntryId, EmailQueueEntry>, key: QueueKey) -> bool {
        entries.values().any(|e| !e.deleted && e.key() == key)
    }
}

#[async_trait]
impl EmailQueueStore for InMemoryEmailQueueStore {
    async fn add(&self, entry: EmailQueueEntry) -> Result<bool, DeliveryStoreError> {
        let mut entries = self.entries.lock().unwrap();
        if Self::live_key_exists(&entries, entry.key()) {
            return Ok(false);
        }
        entries.insert(entry.id, entry);
        Ok(true)
    }

    async fn get(&self, id: EmailEntryId) -> Result<EmailQueueEntry, DeliveryStoreError> {
        self.entries
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(DeliveryStoreError::NotFound)
    }

    async fn claim_due(
        &self,
        mailing_id: MailingId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmailQueueEntry>, DeliveryStoreError> {
        let mut entries = self.entries.lock().unwrap();
        let mut due: Vec<EmailEntryId> = entries
            .values()
            .filter(|e| e.mailing_id == mailing_id && e.selectable(now, self.claim_window))
            .map(|e| e.id)
            .collect();
        due.sort_by_key(|id| entries[id].send_date_time);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(entry) = entries.get_mut(&id) {
                entry.in_queue = true;
                entry.in_queue_at = Some(now);
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn delete(&self, key: QueueKey) -> Result<(), DeliveryStoreError> {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if !entry.deleted && entry.key() == key {
                entry.deleted = true;
                entry.in_queue = false;
                entry.in_queue_at = None;
            }
        }
        Ok(())
    }

    async fn bump_send_attempts(
        &self,
        id: EmailEntryId,
        _now: DateTime<Utc>,
    ) -> Result<u32, DeliveryStoreError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&id).ok_or(DeliveryStoreError::NotFound)?;
        entry.send_attempts += 1;
        entry.in_queue = false;
        entry.in_queue_at = None;
        Ok(entry.send_attempts)
    }

    async fn pending_count(&self, mailing_id: MailingId) -> Result<u64, DeliveryStoreError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .values()
            .filter(|e| !e.deleted && e.mailing_id == mailing_id)
            .count() as u64)
    }
}
