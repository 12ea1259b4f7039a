//! Email queueing service.
//!
//! Moves due mailings into the delivery queue one bounded batch per run:
//! enumerate not-yet-evaluated targets, run the validation chain, insert
//! queue rows for the survivors and log a `blocked-<key>` entry for the
//! rest. A mailing whose target set is exhausted gets its queueing-finished
//! flag set so the processor knows the queue is complete.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use mailforge_campaigns::{
    validate_target, Activity, CampaignLogEntry, EmailQueueEntry, Mailing, MailingStatus,
    RejectReason, Target, TargetRef, ValidationFeedback,
};
use mailforge_core::Clock;

use crate::error::PipelineError;
use crate::log_store::CampaignLogStore;
use crate::mailing_store::MailingStore;
use crate::queue_store::EmailQueueStore;
use crate::targets::TargetProvider;
use crate::PipelineConfig;

/// Outcome of one queueing run, summed over every due mailing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueingReport {
    /// Mailings that had a batch processed.
    pub mailings: usize,
    /// Queue rows inserted.
    pub queued: usize,
    /// Targets rejected by the validation chain (including duplicates).
    pub rejected: usize,
    /// Mailings whose target set is now fully evaluated.
    pub finished: usize,
    /// Mailings abandoned (missing account/template) or failed on a store
    /// error; they are retried on the next run.
    pub abandoned: usize,
}

/// Drives queue population for all due mailings.
pub struct QueueingService {
    mailings: Arc<dyn MailingStore>,
    targets: Arc<dyn TargetProvider>,
    queue: Arc<dyn EmailQueueStore>,
    log: Arc<dyn CampaignLogStore>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl QueueingService {
    pub fn new(
        mailings: Arc<dyn MailingStore>,
        targets: Arc<dyn TargetProvider>,
        queue: Arc<dyn EmailQueueStore>,
        log: Arc<dyn CampaignLogStore>,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            mailings,
            targets,
            queue,
            log,
            config,
            clock,
        }
    }

    /// Process one batch for every mailing due for queueing.
    ///
    /// A failure in one mailing never touches its siblings; the failing
    /// mailing is picked up again on the next run.
    pub async fn queue_emails(&self) -> Result<QueueingReport, PipelineError> {
        let now = self.clock.now();
        let due = self.mailings.list_queueing_due(now).await?;
        let mut report = QueueingReport::default();

        for mailing in due {
            match self.queue_mailing(&mailing, now, &mut report).await {
                Ok(true) => report.mailings += 1,
                Ok(false) => {}
                Err(e) => {
                    report.abandoned += 1;
                    warn!(mailing = %mailing.id, error = %e, "queueing failed for mailing");
                }
            }
        }

        info!(
            mailings = report.mailings,
            queued = report.queued,
            rejected = report.rejected,
            finished = report.finished,
            "queueing run complete"
        );
        Ok(report)
    }

    async fn queue_mailing(
        &self,
        mailing: &Mailing,
        now: DateTime<Utc>,
        report: &mut QueueingReport,
    ) -> Result<bool, PipelineError> {
        if mailing.outbound_account.is_none() {
            error!(mailing = %mailing.id, "mailing has no outbound account, abandoning");
            report.abandoned += 1;
            return Ok(false);
        }
        if mailing.body_html.is_empty() && mailing.body_text.is_empty() {
            error!(mailing = %mailing.id, "mailing has no message body, abandoning");
            report.abandoned += 1;
            return Ok(false);
        }

        // Sending mailings resuming an unfinished queue keep their status.
        if matches!(
            mailing.status,
            MailingStatus::Draft | MailingStatus::Scheduled
        ) {
            self.mailings
                .set_status(mailing.id, MailingStatus::Queueing, now)
                .await?;
        }

        let lists = self.targets.suppression(mailing.campaign_id).await?;
        let batch = self
            .targets
            .next_targets(mailing.campaign_id, self.config.batch_size)
            .await?;
        debug!(mailing = %mailing.id, batch = batch.len(), "evaluating target batch");

        for reference in batch {
            let feedback = match self.materialize(&reference).await? {
                Some(target) => {
                    let feedback = validate_target(&target, &self.config.policy, &lists);
                    match feedback {
                        ValidationFeedback::Passed => {
                            // A target the ledger already records as sent to
                            // for this mailing must not go out twice, even
                            // after its queue row is deleted.
                            let sent = self
                                .log
                                .has_activity(mailing.id, reference.target_id, Activity::Targeted)
                                .await?;
                            if sent {
                                Some((target.email.clone(), RejectReason::Duplicate))
                            } else {
                                let entry = EmailQueueEntry::new(
                                    mailing.campaign_id,
                                    mailing.id,
                                    reference.list_id,
                                    reference.target_id,
                                    reference.kind,
                                    mailing.send_date,
                                );
                                if self.queue.add(entry).await? {
                                    report.queued += 1;
                                    None
                                } else {
                                    Some((target.email.clone(), RejectReason::Duplicate))
                                }
                            }
                        }
                        ValidationFeedback::Rejected(reason) => Some((target.email, reason)),
                    }
                }
                // No usable record behind the reference.
                None => Some((String::new(), RejectReason::InvalidAddress)),
            };

            if let Some((email, reason)) = feedback {
                report.rejected += 1;
                self.log
                    .append(CampaignLogEntry::new(
                        mailing.campaign_id,
                        mailing.id,
                        email,
                        Activity::Blocked(reason),
                        reference.list_id,
                        reference.target_id,
                        reference.kind,
                        now,
                    ))
                    .await?;
            }

            self.targets
                .mark_evaluated(mailing.campaign_id, reference.target_id)
                .await?;
        }

        if self.targets.remaining(mailing.campaign_id).await? == 0 {
            self.mailings.set_queueing_finished(mailing.id).await?;
            report.finished += 1;
            info!(mailing = %mailing.id, "queueing finished");
        }

        Ok(true)
    }

    /// Load and materialize a target; a missing or unreadable record yields
    /// `None` and is rejected by the caller.
    async fn materialize(&self, reference: &TargetRef) -> Result<Option<Target>, PipelineError> {
        let Some(record) = self
            .targets
            .load(reference.kind, reference.target_id)
            .await?
        else {
            return Ok(None);
        };
        Ok(Target::from_record(*reference, &record).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mailforge_campaigns::{SuppressionLists, TargetKind};
    use mailforge_core::{AccountId, CampaignId, FixedClock, Record, TargetId};

    use crate::log_store::InMemoryCampaignLog;
    use crate::mailing_store::InMemoryMailingStore;
    use crate::queue_store::InMemoryEmailQueueStore;
    use crate::targets::InMemoryTargetProvider;

    struct Fixture {
        mailings: Arc<InMemoryMailingStore>,
        targets: Arc<InMemoryTargetProvider>,
        queue: Arc<InMemoryEmailQueueStore>,
        log: Arc<InMemoryCampaignLog>,
        service: QueueingService,
        campaign: CampaignId,
        mailing: Mailing,
    }

    fn fixture(now: DateTime<Utc>, batch_size: usize) -> Fixture {
        let mailings = Arc::new(InMemoryMailingStore::new());
        let targets = Arc::new(InMemoryTargetProvider::new());
        let queue = Arc::new(InMemoryEmailQueueStore::new());
        let log = Arc::new(InMemoryCampaignLog::new());

        let campaign = CampaignId::new();
        let mut mailing = Mailing::new(campaign, "launch", now - Duration::minutes(5))
            .with_account(AccountId::new())
            .with_content("hi", "<p>hi</p>", "hi");
        mailing.transition_to(MailingStatus::Scheduled, now).unwrap();
        mailings.insert(mailing.clone());

        let service = QueueingService::new(
            mailings.clone(),
            targets.clone(),
            queue.clone(),
            log.clone(),
            PipelineConfig {
                batch_size,
                ..PipelineConfig::default()
            },
            Arc::new(FixedClock::at(now)),
        );

        Fixture {
            mailings,
            targets,
            queue,
            log,
            service,
            campaign,
            mailing,
        }
    }

    fn seed(f: &Fixture, email: &str) -> TargetId {
        let reference = TargetRef {
            target_id: TargetId::new(),
            kind: TargetKind::Contact,
            list_id: None,
        };
        let record = Record::new("contacts", reference.target_id.to_string()).with("email", email);
        f.targets.seed_target(f.campaign, reference, record);
        reference.target_id
    }

    #[tokio::test]
    async fn queues_valid_targets_and_finishes() {
        let now = Utc::now();
        let f = fixture(now, 10);
        seed(&f, "ada@example.com");
        seed(&f, "grace@example.com");

        let report = f.service.queue_emails().await.unwrap();
        assert_eq!(report.queued, 2);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.finished, 1);

        let mailing = f.mailings.get(f.mailing.id).await.unwrap();
        assert_eq!(mailing.status, MailingStatus::Queueing);
        assert!(mailing.queueing_finished);
        assert_eq!(f.queue.pending_count(f.mailing.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn opted_out_target_is_blocked_not_queued() {
        let now = Utc::now();
        let f = fixture(now, 10);
        let reference = TargetRef {
            target_id: TargetId::new(),
            kind: TargetKind::Contact,
            list_id: None,
        };
        let record = Record::new("contacts", reference.target_id.to_string())
            .with("email", "ada@example.com")
            .with("email_opt_out", true);
        f.targets.seed_target(f.campaign, reference, record);

        let report = f.service.queue_emails().await.unwrap();
        assert_eq!(report.queued, 0);
        assert_eq!(report.rejected, 1);
        assert_eq!(f.queue.pending_count(f.mailing.id).await.unwrap(), 0);
        assert_eq!(f.log.labels(f.campaign), vec!["blocked-opt-out"]);
    }

    #[tokio::test]
    async fn suppressed_domain_is_blocked() {
        let now = Utc::now();
        let f = fixture(now, 10);
        seed(&f, "ada@blocked.org");
        let mut lists = SuppressionLists::default();
        lists.suppress_domain("blocked.org");
        f.targets.set_suppression(f.campaign, lists);

        f.service.queue_emails().await.unwrap();
        assert_eq!(f.log.labels(f.campaign), vec!["blocked-domain-suppression"]);
    }

    #[tokio::test]
    async fn queueing_resumes_across_runs_in_batches() {
        let now = Utc::now();
        let f = fixture(now, 2);
        for i in 0..3 {
            seed(&f, &format!("t{i}@example.com"));
        }

        let first = f.service.queue_emails().await.unwrap();
        assert_eq!(first.queued, 2);
        assert_eq!(first.finished, 0);
        assert!(!f.mailings.get(f.mailing.id).await.unwrap().queueing_finished);

        let second = f.service.queue_emails().await.unwrap();
        assert_eq!(second.queued, 1);
        assert_eq!(second.finished, 1);
        assert!(f.mailings.get(f.mailing.id).await.unwrap().queueing_finished);
    }

    #[tokio::test]
    async fn target_already_sent_to_is_not_requeued() {
        let now = Utc::now();
        let f = fixture(now, 10);
        let sent = seed(&f, "ada@example.com");
        seed(&f, "grace@example.com");

        // An earlier run sent to this target; its queue row is long deleted
        // but the ledger keeps the targeted entry.
        f.log
            .append(CampaignLogEntry::new(
                f.campaign,
                f.mailing.id,
                "ada@example.com",
                Activity::Targeted,
                None,
                sent,
                TargetKind::Contact,
                now - Duration::days(1),
            ))
            .await
            .unwrap();

        let report = f.service.queue_emails().await.unwrap();
        assert_eq!(report.queued, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(f.queue.pending_count(f.mailing.id).await.unwrap(), 1);
        assert!(f
            .log
            .labels(f.campaign)
            .contains(&"blocked-duplicate".to_string()));
    }

    #[tokio::test]
    async fn queueing_resumes_while_the_mailing_is_already_sending() {
        let now = Utc::now();
        let f = fixture(now, 10);
        seed(&f, "late@example.com");
        f.mailings
            .set_status(f.mailing.id, MailingStatus::Queueing, now)
            .await
            .unwrap();
        f.mailings
            .set_status(f.mailing.id, MailingStatus::Sending, now)
            .await
            .unwrap();

        let report = f.service.queue_emails().await.unwrap();
        assert_eq!(report.queued, 1);
        assert_eq!(report.abandoned, 0);
        // The status never moves backward to Queueing.
        assert_eq!(
            f.mailings.get(f.mailing.id).await.unwrap().status,
            MailingStatus::Sending
        );
    }

    #[tokio::test]
    async fn duplicate_queue_row_is_logged_as_blocked() {
        let now = Utc::now();
        let f = fixture(now, 10);
        let target_id = seed(&f, "ada@example.com");

        // A row for the same (mailing, target, kind) already exists.
        f.queue
            .add(EmailQueueEntry::new(
                f.campaign,
                f.mailing.id,
                None,
                target_id,
                TargetKind::Contact,
                now,
            ))
            .await
            .unwrap();

        let report = f.service.queue_emails().await.unwrap();
        assert_eq!(report.queued, 0);
        assert_eq!(report.rejected, 1);
        assert_eq!(f.log.labels(f.campaign), vec!["blocked-duplicate"]);
    }

    #[tokio::test]
    async fn missing_account_abandons_only_that_mailing() {
        let now = Utc::now();
        let f = fixture(now, 10);
        seed(&f, "ada@example.com");

        // Second mailing on another campaign, without an outbound account.
        let other_campaign = CampaignId::new();
        let mut broken = Mailing::new(other_campaign, "broken", now - Duration::minutes(5))
            .with_content("hi", "<p>hi</p>", "hi");
        broken.transition_to(MailingStatus::Scheduled, now).unwrap();
        let broken_id = broken.id;
        f.mailings.insert(broken);

        let report = f.service.queue_emails().await.unwrap();
        assert_eq!(report.queued, 1);
        assert_eq!(report.abandoned, 1);

        // The healthy mailing progressed; the broken one did not.
        assert_eq!(
            f.mailings.get(f.mailing.id).await.unwrap().status,
            MailingStatus::Queueing
        );
        assert_eq!(
            f.mailings.get(broken_id).await.unwrap().status,
            MailingStatus::Scheduled
        );
    }
}
