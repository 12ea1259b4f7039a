//! Postgres email queue store.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use mailforge_campaigns::{EmailQueueEntry, QueueKey, TargetKind};
use mailforge_core::{CampaignId, EmailEntryId, ListId, MailingId, TargetId};
use mailforge_delivery::{DeliveryStoreError, EmailQueueStore};

/// Email queue over the `email_queue` table.
///
/// Uniqueness rides on the partial unique index over live rows; claiming
/// marks rows `in_queue` with `FOR UPDATE SKIP LOCKED` inside one statement
/// so overlapping processor runs divide the queue instead of double-sending.
#[derive(Clone)]
pub struct PostgresEmailQueueStore {
    pool: Arc<PgPool>,
    claim_window: Duration,
}

impl PostgresEmailQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_claim_window(pool, Duration::hours(24))
    }

    pub fn with_claim_window(pool: PgPool, claim_window: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            claim_window,
        }
    }
}

fn storage(e: sqlx::Error) -> DeliveryStoreError {
    DeliveryStoreError::Storage(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<EmailQueueEntry, DeliveryStoreError> {
    let kind: String = row.try_get("target_kind").map_err(storage)?;
    Ok(EmailQueueEntry {
        id: EmailEntryId::from_uuid(row.try_get::<Uuid, _>("id").map_err(storage)?),
        campaign_id: CampaignId::from_uuid(row.try_get::<Uuid, _>("campaign_id").map_err(storage)?),
        mailing_id: MailingId::from_uuid(row.try_get::<Uuid, _>("mailing_id").map_err(storage)?),
        list_id: row
            .try_get::<Option<Uuid>, _>("list_id")
            .map_err(storage)?
            .map(ListId::from_uuid),
        target_id: TargetId::from_uuid(row.try_get::<Uuid, _>("target_id").map_err(storage)?),
        target_kind: TargetKind::from_str(&kind)
            .map_err(|e| DeliveryStoreError::Storage(e.to_string()))?,
        send_attempts: row.try_get::<i32, _>("send_attempts").map_err(storage)? as u32,
        send_date_time: row.try_get("send_date_time").map_err(storage)?,
        in_queue: row.try_get("in_queue").map_err(storage)?,
        in_queue_at: row.try_get("in_queue_at").map_err(storage)?,
        deleted: row.try_get("deleted").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

#[async_trait]
impl EmailQueueStore for PostgresEmailQueueStore {
    async fn add(&self, entry: EmailQueueEntry) -> Result<bool, DeliveryStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_queue
                (id, campaign_id, mailing_id, list_id, target_id, target_kind,
                 send_attempts, send_date_time, in_queue, in_queue_at, deleted,
                 created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.campaign_id.as_uuid())
        .bind(entry.mailing_id.as_uuid())
        .bind(entry.list_id.map(|l| *l.as_uuid()))
        .bind(entry.target_id.as_uuid())
        .bind(entry.target_kind.as_str())
        .bind(entry.send_attempts as i32)
        .bind(entry.send_date_time)
        .bind(entry.in_queue)
        .bind(entry.in_queue_at)
        .bind(entry.deleted)
        .bind(entry.created_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(storage(e)),
        }
    }

    async fn get(&self, id: EmailEntryId) -> Result<EmailQueueEntry, DeliveryStoreError> {
        let row = sqlx::query("SELECT * FROM email_queue WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage)?
            .ok_or(DeliveryStoreError::NotFound)?;
        entry_from_row(&row)
    }

    async fn claim_due(
        &self,
        mailing_id: MailingId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmailQueueEntry>, DeliveryStoreError> {
        let stale_before = now - self.claim_window;
        let rows = sqlx::query(
            r#"
            UPDATE email_queue
            SET in_queue = TRUE, in_queue_at = $2
            WHERE id IN (
                SELECT id FROM email_queue
                WHERE mailing_id = $1
                  AND NOT deleted
                  AND send_date_time <= $2
                  AND (NOT in_queue OR in_queue_at <= $3)
                ORDER BY send_date_time, id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(mailing_id.as_uuid())
        .bind(now)
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn delete(&self, key: QueueKey) -> Result<(), DeliveryStoreError> {
        sqlx::query(
            r#"
            UPDATE email_queue
            SET deleted = TRUE, in_queue = FALSE, in_queue_at = NULL
            WHERE mailing_id = $1 AND target_id = $2 AND target_kind = $3
              AND NOT deleted
            "#,
        )
        .bind(key.mailing_id.as_uuid())
        .bind(key.target_id.as_uuid())
        .bind(key.target_kind.as_str())
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn bump_send_attempts(
        &self,
        id: EmailEntryId,
        _now: DateTime<Utc>,
    ) -> Result<u32, DeliveryStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE email_queue
            SET send_attempts = send_attempts + 1,
                in_queue = FALSE, in_queue_at = NULL
            WHERE id = $1
            RETURNING send_attempts
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage)?
        .ok_or(DeliveryStoreError::NotFound)?;
        let attempts: i32 = row.try_get("send_attempts").map_err(storage)?;
        Ok(attempts as u32)
    }

    async fn pending_count(&self, mailing_id: MailingId) -> Result<u64, DeliveryStoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM email_queue WHERE mailing_id = $1 AND NOT deleted",
        )
        .bind(mailing_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(storage)?;
        let n: i64 = row.try_get("n").map_err(storage)?;
        Ok(n as u64)
    }
}
