//! Mailing entity and status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailforge_core::{AccountId, CampaignId, DomainError, DomainResult, MailingId};

/// Mailing status lifecycle.
///
/// Statuses only move forward (plus `Inactive` on unschedule). Queueing
/// completion is tracked separately on [`Mailing::queueing_finished`] because
/// sending may begin while earlier batches are still being queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailingStatus {
    Draft,
    Scheduled,
    Queueing,
    Sending,
    Sent,
    Inactive,
}

impl MailingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailingStatus::Draft => "draft",
            MailingStatus::Scheduled => "scheduled",
            MailingStatus::Queueing => "queueing",
            MailingStatus::Sending => "sending",
            MailingStatus::Sent => "sent",
            MailingStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "draft" => Ok(MailingStatus::Draft),
            "scheduled" => Ok(MailingStatus::Scheduled),
            "queueing" => Ok(MailingStatus::Queueing),
            "sending" => Ok(MailingStatus::Sending),
            "sent" => Ok(MailingStatus::Sent),
            "inactive" => Ok(MailingStatus::Inactive),
            other => Err(DomainError::validation(format!(
                "unknown mailing status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MailingStatus::Sent | MailingStatus::Inactive)
    }

    /// Whether moving from `self` to `to` is a legal lifecycle step.
    ///
    /// Setting the current status again is a no-op and always allowed.
    pub fn can_transition_to(&self, to: MailingStatus) -> bool {
        use MailingStatus::*;

        if *self == to {
            return true;
        }

        match (*self, to) {
            (Draft, Scheduled) => true,
            (Draft, Queueing) | (Scheduled, Queueing) => true,
            (Queueing, Sending) => true,
            (Sending, Sent) => true,
            // Unschedule is allowed from any non-terminal status.
            (from, Inactive) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// One email-marketing send of a campaign.
///
/// Carries everything the pipeline needs to queue and deliver: the lifecycle
/// status, the scheduled send date, the outbound account, and the message
/// content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mailing {
    pub id: MailingId,
    pub campaign_id: CampaignId,
    pub name: String,
    pub status: MailingStatus,
    /// Queueing has evaluated every eligible target (queued or rejected).
    pub queueing_finished: bool,
    pub send_date: DateTime<Utc>,
    /// Outbound account used for delivery; queueing is abandoned without one.
    pub outbound_account: Option<AccountId>,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    /// Queue targets from every prospect list of the campaign.
    pub all_prospect_lists: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Mailing {
    pub fn new(campaign_id: CampaignId, name: impl Into<String>, send_date: DateTime<Utc>) -> Self {
        let now = send_date;
        Self {
            id: MailingId::new(),
            campaign_id,
            name: name.into(),
            status: MailingStatus::Draft,
            queueing_finished: false,
            send_date,
            outbound_account: None,
            subject: String::new(),
            body_html: String::new(),
            body_text: String::new(),
            all_prospect_lists: false,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_account(mut self, account: AccountId) -> Self {
        self.outbound_account = Some(account);
        self
    }

    pub fn with_content(
        mut self,
        subject: impl Into<String>,
        html: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.subject = subject.into();
        self.body_html = html.into();
        self.body_text = text.into();
        self
    }

    /// Apply a status transition, rejecting illegal steps.
    pub fn transition_to(&mut self, to: MailingStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::illegal_transition(format!(
                "mailing {}: {} -> {}",
                self.id,
                self.status.as_str(),
                to.as_str()
            )));
        }
        self.status = to;
        self.modified_at = now;
        Ok(())
    }

    /// Eligible to begin (or resume) queueing at `now`.
    pub fn queueing_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            MailingStatus::Draft | MailingStatus::Scheduled => self.send_date <= now,
            MailingStatus::Queueing | MailingStatus::Sending => !self.queueing_finished,
            MailingStatus::Sent | MailingStatus::Inactive => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn mailing() -> Mailing {
        Mailing::new(CampaignId::new(), "spring launch", Utc::now())
    }

    #[test]
    fn forward_transitions_are_legal() {
        let now = Utc::now();
        let mut m = mailing();

        m.transition_to(MailingStatus::Scheduled, now).unwrap();
        m.transition_to(MailingStatus::Queueing, now).unwrap();
        m.transition_to(MailingStatus::Sending, now).unwrap();
        m.transition_to(MailingStatus::Sent, now).unwrap();
        assert!(m.status.is_terminal());
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let now = Utc::now();
        let mut m = mailing();
        m.transition_to(MailingStatus::Queueing, now).unwrap();

        let err = m.transition_to(MailingStatus::Draft, now).unwrap_err();
        assert!(matches!(err, DomainError::IllegalTransition(_)));
        assert_eq!(m.status, MailingStatus::Queueing);
    }

    #[test]
    fn unschedule_from_any_non_terminal_status() {
        let now = Utc::now();
        for status in [
            MailingStatus::Draft,
            MailingStatus::Scheduled,
            MailingStatus::Queueing,
            MailingStatus::Sending,
        ] {
            assert!(status.can_transition_to(MailingStatus::Inactive));
        }
        let mut m = mailing();
        m.transition_to(MailingStatus::Sent, now).unwrap_err();

        let mut sent = mailing();
        sent.transition_to(MailingStatus::Queueing, now).unwrap();
        sent.transition_to(MailingStatus::Sending, now).unwrap();
        sent.transition_to(MailingStatus::Sent, now).unwrap();
        assert!(!sent.status.can_transition_to(MailingStatus::Inactive));
    }

    #[test]
    fn queueing_due_respects_send_date_and_flag() {
        let now = Utc::now();
        let mut m = Mailing::new(CampaignId::new(), "m", now + Duration::hours(1));
        assert!(!m.queueing_due(now));

        m.send_date = now - Duration::minutes(1);
        assert!(m.queueing_due(now));

        m.transition_to(MailingStatus::Queueing, now).unwrap();
        assert!(m.queueing_due(now));

        m.queueing_finished = true;
        assert!(!m.queueing_due(now));
    }

    fn status_strategy() -> impl Strategy<Value = MailingStatus> {
        prop_oneof![
            Just(MailingStatus::Draft),
            Just(MailingStatus::Scheduled),
            Just(MailingStatus::Queueing),
            Just(MailingStatus::Sending),
            Just(MailingStatus::Sent),
            Just(MailingStatus::Inactive),
        ]
    }

    fn rank(status: MailingStatus) -> u8 {
        match status {
            MailingStatus::Draft => 0,
            MailingStatus::Scheduled => 1,
            MailingStatus::Queueing => 2,
            MailingStatus::Sending => 3,
            MailingStatus::Sent => 4,
            MailingStatus::Inactive => 5,
        }
    }

    proptest! {
        /// Legal transitions never move backward through the lifecycle.
        #[test]
        fn transitions_are_forward_only(from in status_strategy(), to in status_strategy()) {
            if from.can_transition_to(to) {
                prop_assert!(rank(to) >= rank(from) || to == MailingStatus::Inactive);
            }
        }

        /// Terminal statuses admit no transition except the no-op.
        #[test]
        fn terminal_statuses_are_sticky(to in status_strategy()) {
            for terminal in [MailingStatus::Sent, MailingStatus::Inactive] {
                if terminal.can_transition_to(to) {
                    prop_assert_eq!(to, terminal);
                }
            }
        }
    }
}
