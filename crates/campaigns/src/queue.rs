//! Durable per-mailing email delivery queue entry.
//!
//! Distinct from the generic job queue: one row per validated recipient still
//! awaiting delivery. Rows are deleted on success or when the retry ceiling
//! is exceeded; the campaign log, not this table, is the durable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailforge_core::{CampaignId, EmailEntryId, ListId, MailingId, TargetId};

use crate::target::TargetKind;

/// Send attempts after which an entry is given up (deleted with a
/// `send error` log entry). The give-up check is `send_attempts > MAX`,
/// so the sixth failure is the last.
pub const MAX_SEND_ATTEMPTS: u32 = 5;

/// Composite identity of a queue row: one live row per
/// (mailing, target, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub mailing_id: MailingId,
    pub target_id: TargetId,
    pub target_kind: TargetKind,
}

/// One recipient awaiting delivery for a mailing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailQueueEntry {
    pub id: EmailEntryId,
    pub campaign_id: CampaignId,
    pub mailing_id: MailingId,
    pub list_id: Option<ListId>,
    pub target_id: TargetId,
    pub target_kind: TargetKind,
    pub send_attempts: u32,
    /// Earliest time the entry may be sent.
    pub send_date_time: DateTime<Utc>,
    /// Claimed by a processor run; cleared once handled or expired.
    pub in_queue: bool,
    pub in_queue_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl EmailQueueEntry {
    pub fn new(
        campaign_id: CampaignId,
        mailing_id: MailingId,
        list_id: Option<ListId>,
        target_id: TargetId,
        target_kind: TargetKind,
        send_date_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EmailEntryId::new(),
            campaign_id,
            mailing_id,
            list_id,
            target_id,
            target_kind,
            send_attempts: 0,
            send_date_time,
            in_queue: false,
            in_queue_at: None,
            deleted: false,
            created_at: send_date_time,
        }
    }

    pub fn key(&self) -> QueueKey {
        QueueKey {
            mailing_id: self.mailing_id,
            target_id: self.target_id,
            target_kind: self.target_kind,
        }
    }

    /// Entry has exceeded the retry ceiling and must be given up.
    pub fn exhausted(&self) -> bool {
        self.send_attempts > MAX_SEND_ATTEMPTS
    }

    /// Due for sending at `now` and not claimed by a recent processor run.
    ///
    /// A claim older than `claim_window` is treated as abandoned (the run
    /// crashed or was cut off) and the entry becomes selectable again.
    pub fn selectable(&self, now: DateTime<Utc>, claim_window: chrono::Duration) -> bool {
        if self.deleted || self.send_date_time > now {
            return false;
        }
        match (self.in_queue, self.in_queue_at) {
            (true, Some(at)) => now - at >= claim_window,
            (true, None) => false,
            (false, _) => true,
        }
    }
}
