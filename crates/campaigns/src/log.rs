//! Append-only campaign activity log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailforge_core::{CampaignId, ListId, MailingId, TargetId};

use crate::suppression::RejectReason;
use crate::target::TargetKind;

/// What happened to a target, in the vocabulary the log stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    /// Message handed to the transport successfully.
    Targeted,
    /// Rejected by the validation chain.
    Blocked(RejectReason),
    /// Transport gave up after the retry ceiling.
    SendError,
    /// Address failed syntax validation at send-time.
    InvalidEmail,
    /// Recipient opened the message (tracker write, external).
    Viewed,
    /// Recipient followed a tracked link (tracker write, external).
    Link,
    /// Recipient was removed/unsubscribed (tracker write, external).
    Removed,
}

impl Activity {
    /// Stable label stored in the `activity_type` column.
    pub fn label(&self) -> String {
        match self {
            Activity::Targeted => "targeted".to_string(),
            Activity::Blocked(reason) => format!("blocked-{}", reason.key()),
            Activity::SendError => "send error".to_string(),
            Activity::InvalidEmail => "invalid email".to_string(),
            Activity::Viewed => "viewed".to_string(),
            Activity::Link => "link".to_string(),
            Activity::Removed => "removed".to_string(),
        }
    }

    /// Inverse of [`Activity::label`], for rows read back from storage.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "targeted" => Some(Activity::Targeted),
            "send error" => Some(Activity::SendError),
            "invalid email" => Some(Activity::InvalidEmail),
            "viewed" => Some(Activity::Viewed),
            "link" => Some(Activity::Link),
            "removed" => Some(Activity::Removed),
            other => other
                .strip_prefix("blocked-")
                .and_then(RejectReason::from_key)
                .map(Activity::Blocked),
        }
    }
}

/// One write-once row in the delivery ledger.
///
/// Entries are never updated or deleted; they are the durable record of every
/// send attempt outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignLogEntry {
    pub campaign_id: CampaignId,
    pub mailing_id: MailingId,
    pub email: String,
    pub activity: Activity,
    pub list_id: Option<ListId>,
    pub target_id: TargetId,
    pub target_kind: TargetKind,
    pub occurred_at: DateTime<Utc>,
}

impl CampaignLogEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaign_id: CampaignId,
        mailing_id: MailingId,
        email: impl Into<String>,
        activity: Activity,
        list_id: Option<ListId>,
        target_id: TargetId,
        target_kind: TargetKind,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            campaign_id,
            mailing_id,
            email: email.into(),
            activity,
            list_id,
            target_id,
            target_kind,
            occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_match_the_ledger_vocabulary() {
        assert_eq!(Activity::Targeted.label(), "targeted");
        assert_eq!(Activity::SendError.label(), "send error");
        assert_eq!(Activity::InvalidEmail.label(), "invalid email");
        assert_eq!(
            Activity::Blocked(RejectReason::OptOut).label(),
            "blocked-opt-out"
        );
        assert_eq!(
            Activity::Blocked(RejectReason::DomainSuppressed).label(),
            "blocked-domain-suppression"
        );
    }
}
