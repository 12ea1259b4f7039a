//! Email queue processor.
//!
//! Drains the delivery queue in bounded batches: claim due entries,
//! re-validate each recipient against current suppression state, hand the
//! rendered message to the mailer, and record the outcome in the campaign
//! log. Successful and permanently-rejected entries are deleted; transport
//! failures are retried across cycles until the attempt ceiling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use mailforge_campaigns::{
    validate_target, Activity, CampaignLogEntry, EmailQueueEntry, Mailing, MailingStatus,
    RejectReason, Target, ValidationFeedback, MAX_SEND_ATTEMPTS,
};
use mailforge_core::{AccountId, Clock};

use crate::error::PipelineError;
use crate::log_store::CampaignLogStore;
use crate::mailer::{Mailer, OutboundEmail};
use crate::mailing_store::MailingStore;
use crate::queue_store::EmailQueueStore;
use crate::targets::TargetProvider;
use crate::PipelineConfig;

/// Outcome of one processor run, summed over every sendable mailing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SendReport {
    /// Messages handed to the transport successfully.
    pub sent: usize,
    /// Entries rejected at send-time by the validation chain.
    pub blocked: usize,
    /// Entries left in the queue for another attempt.
    pub retried: usize,
    /// Entries deleted after exceeding the attempt ceiling.
    pub gave_up: usize,
    /// Mailings that reached `Sent` this run.
    pub completed: usize,
}

/// Drives queue draining for all sendable mailings.
pub struct QueueProcessor {
    mailings: Arc<dyn MailingStore>,
    targets: Arc<dyn TargetProvider>,
    queue: Arc<dyn EmailQueueStore>,
    log: Arc<dyn CampaignLogStore>,
    mailer: Arc<dyn Mailer>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl QueueProcessor {
    pub fn new(
        mailings: Arc<dyn MailingStore>,
        targets: Arc<dyn TargetProvider>,
        queue: Arc<dyn EmailQueueStore>,
        log: Arc<dyn CampaignLogStore>,
        mailer: Arc<dyn Mailer>,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            mailings,
            targets,
            queue,
            log,
            mailer,
            config,
            clock,
        }
    }

    /// Process one batch for every mailing in status queueing or sending.
    ///
    /// Per-mailing errors are logged and isolated; siblings still run.
    pub async fn process_queue(&self) -> Result<SendReport, PipelineError> {
        let now = self.clock.now();
        let sendable = self.mailings.list_sendable().await?;
        let mut report = SendReport::default();

        for mailing in sendable {
            if let Err(e) = self.process_mailing(&mailing, now, &mut report).await {
                warn!(mailing = %mailing.id, error = %e, "processing failed for mailing");
            }
        }

        info!(
            sent = report.sent,
            blocked = report.blocked,
            retried = report.retried,
            gave_up = report.gave_up,
            completed = report.completed,
            "processor run complete"
        );
        Ok(report)
    }

    async fn process_mailing(
        &self,
        mailing: &Mailing,
        now: DateTime<Utc>,
        report: &mut SendReport,
    ) -> Result<(), PipelineError> {
        let batch = self
            .queue
            .claim_due(mailing.id, self.config.batch_size, now)
            .await?;
        debug!(mailing = %mailing.id, batch = batch.len(), "claimed queue batch");

        if !batch.is_empty() && mailing.status == MailingStatus::Queueing {
            self.mailings
                .set_status(mailing.id, MailingStatus::Sending, now)
                .await?;
        }

        if !batch.is_empty() {
            let Some(account) = mailing.outbound_account else {
                // Rows exist but the account was since removed; leave the
                // claims to expire and report the mailing broken.
                warn!(mailing = %mailing.id, "queued mailing has no outbound account");
                return Ok(());
            };

            let lists = self.targets.suppression(mailing.campaign_id).await?;
            for entry in batch {
                self.process_entry(mailing, account, &entry, &lists, now, report)
                    .await?;
            }
        }

        // Sent only once the queue is drained and queueing itself finished.
        let current = self.mailings.get(mailing.id).await?;
        if current.queueing_finished
            && !current.status.is_terminal()
            && self.queue.pending_count(mailing.id).await? == 0
        {
            if current.status == MailingStatus::Queueing {
                self.mailings
                    .set_status(mailing.id, MailingStatus::Sending, now)
                    .await?;
            }
            self.mailings
                .set_status(mailing.id, MailingStatus::Sent, now)
                .await?;
            report.completed += 1;
            info!(mailing = %mailing.id, "mailing sent");
        }

        Ok(())
    }

    async fn process_entry(
        &self,
        mailing: &Mailing,
        account: AccountId,
        entry: &EmailQueueEntry,
        lists: &mailforge_campaigns::SuppressionLists,
        now: DateTime<Utc>,
        report: &mut SendReport,
    ) -> Result<(), PipelineError> {
        // A stale claim may resurface an already-exhausted entry.
        if entry.exhausted() {
            self.give_up(mailing, entry, String::new(), now, report)
                .await?;
            return Ok(());
        }

        let reference = mailforge_campaigns::TargetRef {
            target_id: entry.target_id,
            kind: entry.target_kind,
            list_id: entry.list_id,
        };
        let target = match self.targets.load(entry.target_kind, entry.target_id).await? {
            Some(record) => Target::from_record(reference, &record).ok(),
            None => None,
        };

        let Some(target) = target else {
            // Record vanished or lost its address since queue-time.
            self.block(mailing, entry, String::new(), RejectReason::InvalidAddress, now)
                .await?;
            report.blocked += 1;
            return Ok(());
        };

        // Suppression state may have changed since queue-time.
        if let ValidationFeedback::Rejected(reason) =
            validate_target(&target, &self.config.policy, lists)
        {
            self.block(mailing, entry, target.email, reason, now).await?;
            report.blocked += 1;
            return Ok(());
        }

        let email = OutboundEmail {
            to: target.email.clone(),
            to_name: target.name.clone(),
            subject: mailing.subject.clone(),
            body_html: mailing.body_html.clone(),
            body_text: mailing.body_text.clone(),
            account,
        };

        match self.mailer.send(&email).await {
            Ok(()) => {
                self.log
                    .append(CampaignLogEntry::new(
                        mailing.campaign_id,
                        mailing.id,
                        target.email,
                        Activity::Targeted,
                        entry.list_id,
                        entry.target_id,
                        entry.target_kind,
                        now,
                    ))
                    .await?;
                self.queue.delete(entry.key()).await?;
                report.sent += 1;
            }
            Err(e) => {
                let attempts = self.queue.bump_send_attempts(entry.id, now).await?;
                if attempts > MAX_SEND_ATTEMPTS {
                    warn!(
                        mailing = %mailing.id,
                        to = %target.email,
                        attempts,
                        error = %e,
                        "giving up on queue entry"
                    );
                    self.give_up(mailing, entry, target.email, now, report)
                        .await?;
                } else {
                    debug!(
                        mailing = %mailing.id,
                        to = %target.email,
                        attempts,
                        error = %e,
                        "send failed, will retry"
                    );
                    report.retried += 1;
                }
            }
        }

        Ok(())
    }

    async fn block(
        &self,
        mailing: &Mailing,
        entry: &EmailQueueEntry,
        email: String,
        reason: RejectReason,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        self.log
            .append(CampaignLogEntry::new(
                mailing.campaign_id,
                mailing.id,
                email,
                Activity::Blocked(reason),
                entry.list_id,
                entry.target_id,
                entry.target_kind,
                now,
            ))
            .await?;
        self.queue.delete(entry.key()).await?;
        Ok(())
    }

    async fn give_up(
        &self,
        mailing: &Mailing,
        entry: &EmailQueueEntry,
        email: String,
        now: DateTime<Utc>,
        report: &mut SendReport,
    ) -> Result<(), PipelineError> {
        self.log
            .append(CampaignLogEntry::new(
                mailing.campaign_id,
                mailing.id,
                email,
                Activity::SendError,
                entry.list_id,
                entry.target_id,
                entry.target_kind,
                now,
            ))
            .await?;
        self.queue.delete(entry.key()).await?;
        report.gave_up += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mailforge_campaigns::{SuppressionLists, TargetKind, TargetRef};
    use mailforge_core::{CampaignId, FixedClock, Record, TargetId};

    use crate::log_store::InMemoryCampaignLog;
    use crate::mailer::MockMailer;
    use crate::mailing_store::InMemoryMailingStore;
    use crate::queue_store::InMemoryEmailQueueStore;
    use crate::targets::InMemoryTargetProvider;

    struct Fixture {
        mailings: Arc<InMemoryMailingStore>,
        targets: Arc<InMemoryTargetProvider>,
        queue: Arc<InMemoryEmailQueueStore>,
        log: Arc<InMemoryCampaignLog>,
        mailer: Arc<MockMailer>,
        clock: FixedClock,
        processor: QueueProcessor,
        campaign: CampaignId,
        mailing: Mailing,
    }

    fn fixture(now: DateTime<Utc>) -> Fixture {
        let mailings = Arc::new(InMemoryMailingStore::new());
        let targets = Arc::new(InMemoryTargetProvider::new());
        let queue = Arc::new(InMemoryEmailQueueStore::new());
        let log = Arc::new(InMemoryCampaignLog::new());
        let mailer = Arc::new(MockMailer::new());
        let clock = FixedClock::at(now);

        let campaign = CampaignId::new();
        let mut mailing = Mailing::new(campaign, "launch", now - Duration::minutes(5))
            .with_account(mailforge_core::AccountId::new())
            .with_content("hello", "<p>hi</p>", "hi");
        mailing.transition_to(MailingStatus::Queueing, now).unwrap();
        mailing.queueing_finished = true;
        mailings.insert(mailing.clone());

        let processor = QueueProcessor::new(
            mailings.clone(),
            targets.clone(),
            queue.clone(),
            log.clone(),
            mailer.clone(),
            PipelineConfig::default(),
            Arc::new(clock.clone()),
        );

        Fixture {
            mailings,
            targets,
            queue,
            log,
            mailer,
            clock,
            processor,
            campaign,
            mailing,
        }
    }

    async fn enqueue(f: &Fixture, email: &str) -> TargetId {
        let target_id = TargetId::new();
        let reference = TargetRef {
            target_id,
            kind: TargetKind::Contact,
            list_id: None,
        };
        f.targets.seed_target(
            f.campaign,
            reference,
            Record::new("contacts", target_id.to_string()).with("email", email),
        );
        f.queue
            .add(EmailQueueEntry::new(
                f.campaign,
                f.mailing.id,
                None,
                target_id,
                TargetKind::Contact,
                f.mailing.send_date,
            ))
            .await
            .unwrap();
        target_id
    }

    #[tokio::test]
    async fn sends_logs_targeted_and_completes() {
        let now = Utc::now();
        let f = fixture(now);
        enqueue(&f, "ada@example.com").await;
        enqueue(&f, "grace@example.com").await;

        let report = f.processor.process_queue().await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(f.mailer.sent_count(), 2);
        assert_eq!(f.queue.pending_count(f.mailing.id).await.unwrap(), 0);
        assert_eq!(
            f.mailings.get(f.mailing.id).await.unwrap().status,
            MailingStatus::Sent
        );
        assert_eq!(f.log.labels(f.campaign), vec!["targeted", "targeted"]);
    }

    #[tokio::test]
    async fn send_time_revalidation_blocks_and_deletes() {
        let now = Utc::now();
        let f = fixture(now);
        enqueue(&f, "ada@suppressed.org").await;

        // Suppression changed between queue-time and send-time.
        let mut lists = SuppressionLists::default();
        lists.suppress_domain("suppressed.org");
        f.targets.set_suppression(f.campaign, lists);

        let report = f.processor.process_queue().await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.blocked, 1);
        assert_eq!(f.mailer.sent_count(), 0);
        assert_eq!(f.log.labels(f.campaign), vec!["blocked-domain-suppression"]);
        // Blocked entries never retry.
        assert_eq!(f.queue.pending_count(f.mailing.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transport_failures_retry_until_the_sixth_then_give_up() {
        let now = Utc::now();
        let f = fixture(now);
        enqueue(&f, "flaky@example.com").await;
        f.mailer.fail_for("flaky@example.com");

        // Attempts 1 through 5 leave the entry queued for the next cycle.
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            let report = f.processor.process_queue().await.unwrap();
            assert_eq!(report.retried, 1, "attempt {attempt}");
            assert_eq!(report.gave_up, 0, "attempt {attempt}");
            assert_eq!(f.queue.pending_count(f.mailing.id).await.unwrap(), 1);
        }

        // The sixth failure crosses the ceiling: log `send error`, delete.
        let report = f.processor.process_queue().await.unwrap();
        assert_eq!(report.retried, 0);
        assert_eq!(report.gave_up, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(f.queue.pending_count(f.mailing.id).await.unwrap(), 0);
        assert_eq!(f.log.labels(f.campaign).last().map(String::as_str), Some("send error"));
    }

    #[tokio::test]
    async fn recovered_transport_sends_a_retried_entry() {
        let now = Utc::now();
        let f = fixture(now);
        enqueue(&f, "flaky@example.com").await;
        f.mailer.fail_for("flaky@example.com");

        f.processor.process_queue().await.unwrap();
        f.mailer.recover();

        let report = f.processor.process_queue().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(f.log.labels(f.campaign), vec!["targeted"]);
    }

    #[tokio::test]
    async fn empty_queue_with_finished_queueing_marks_sent() {
        let now = Utc::now();
        let f = fixture(now);

        // Zero targets: nothing to send, queueing already finished.
        let report = f.processor.process_queue().await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.completed, 1);
        assert_eq!(
            f.mailings.get(f.mailing.id).await.unwrap().status,
            MailingStatus::Sent
        );
    }

    #[tokio::test]
    async fn unfinished_queueing_never_completes_the_mailing() {
        let now = Utc::now();
        let f = fixture(now);
        let mut m = Mailing::new(f.campaign, "partial", now - Duration::minutes(5))
            .with_account(mailforge_core::AccountId::new())
            .with_content("hello", "<p>hi</p>", "hi");
        m.transition_to(MailingStatus::Queueing, now).unwrap();
        let id = m.id;
        f.mailings.insert(m);

        let report = f.processor.process_queue().await.unwrap();
        assert_eq!(report.completed, 1); // only the fixture mailing
        assert_eq!(
            f.mailings.get(id).await.unwrap().status,
            MailingStatus::Queueing
        );
    }

    #[tokio::test]
    async fn entries_not_yet_due_wait_for_their_send_time() {
        let now = Utc::now();
        let f = fixture(now);
        let target_id = enqueue(&f, "ada@example.com").await;

        // Push the entry's earliest send time into the future.
        let entry = f
            .queue
            .claim_due(f.mailing.id, 10, now)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.target_id == target_id)
            .unwrap();
        f.queue.delete(entry.key()).await.unwrap();
        let mut future = EmailQueueEntry::new(
            f.campaign,
            f.mailing.id,
            None,
            target_id,
            TargetKind::Contact,
            now + Duration::hours(2),
        );
        future.send_attempts = 0;
        f.queue.add(future).await.unwrap();

        let report = f.processor.process_queue().await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.completed, 0);

        f.clock.advance(Duration::hours(3));
        let report = f.processor.process_queue().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.completed, 1);
    }
}
