//! Postgres mailing store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use mailforge_campaigns::{Mailing, MailingStatus};
use mailforge_core::{AccountId, CampaignId, MailingId};
use mailforge_delivery::{DeliveryStoreError, MailingStore};

#[derive(Clone)]
pub struct PostgresMailingStore {
    pool: Arc<PgPool>,
}

impl PostgresMailingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn insert(&self, mailing: &Mailing) -> Result<(), DeliveryStoreError> {
        sqlx::query(
            r#"
            INSERT INTO mailings
                (id, campaign_id, name, status, queueing_finished, send_date,
                 outbound_account, subject, body_html, body_text,
                 all_prospect_lists, created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(mailing.id.as_uuid())
        .bind(mailing.campaign_id.as_uuid())
        .bind(&mailing.name)
        .bind(mailing.status.as_str())
        .bind(mailing.queueing_finished)
        .bind(mailing.send_date)
        .bind(mailing.outbound_account.map(|a| *a.as_uuid()))
        .bind(&mailing.subject)
        .bind(&mailing.body_html)
        .bind(&mailing.body_text)
        .bind(mailing.all_prospect_lists)
        .bind(mailing.created_at)
        .bind(mailing.modified_at)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }
}

fn storage(e: sqlx::Error) -> DeliveryStoreError {
    DeliveryStoreError::Storage(e.to_string())
}

fn mailing_from_row(row: &sqlx::postgres::PgRow) -> Result<Mailing, DeliveryStoreError> {
    let status: String = row.try_get("status").map_err(storage)?;
    Ok(Mailing {
        id: MailingId::from_uuid(row.try_get::<Uuid, _>("id").map_err(storage)?),
        campaign_id: CampaignId::from_uuid(row.try_get::<Uuid, _>("campaign_id").map_err(storage)?),
        name: row.try_get("name").map_err(storage)?,
        status: MailingStatus::parse(&status)
            .map_err(|e| DeliveryStoreError::Storage(e.to_string()))?,
        queueing_finished: row.try_get("queueing_finished").map_err(storage)?,
        send_date: row.try_get("send_date").map_err(storage)?,
        outbound_account: row
            .try_get::<Option<Uuid>, _>("outbound_account")
            .map_err(storage)?
            .map(AccountId::from_uuid),
        subject: row.try_get("subject").map_err(storage)?,
        body_html: row.try_get("body_html").map_err(storage)?,
        body_text: row.try_get("body_text").map_err(storage)?,
        all_prospect_lists: row.try_get("all_prospect_lists").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        modified_at: row.try_get("modified_at").map_err(storage)?,
    })
}

#[async_trait]
impl MailingStore for PostgresMailingStore {
    async fn get(&self, id: MailingId) -> Result<Mailing, DeliveryStoreError> {
        let row = sqlx::query("SELECT * FROM mailings WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage)?
            .ok_or(DeliveryStoreError::NotFound)?;
        mailing_from_row(&row)
    }

    async fn list_queueing_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Mailing>, DeliveryStoreError> {
        // Same predicate as Mailing::queueing_due, expressed over the columns.
        let rows = sqlx::query(
            r#"
            SELECT * FROM mailings
            WHERE (status IN ('draft', 'scheduled') AND send_date <= $1)
               OR (status IN ('queueing', 'sending') AND NOT queueing_finished)
            ORDER BY send_date
            "#,
        )
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(mailing_from_row).collect()
    }

    async fn list_sendable(&self) -> Result<Vec<Mailing>, DeliveryStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mailings
            WHERE status IN ('queueing', 'sending')
            ORDER BY send_date
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(mailing_from_row).collect()
    }

    async fn set_status(
        &self,
        id: MailingId,
        to: MailingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DeliveryStoreError> {
        // The lifecycle check runs against the stored status inside the
        // store, so a stale caller can never force a backward move.
        let mut mailing = self.get(id).await?;
        mailing
            .transition_to(to, now)
            .map_err(|e| DeliveryStoreError::Conflict(e.to_string()))?;

        sqlx::query(
            "UPDATE mailings SET status = $2, modified_at = $3 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(mailing.status.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn set_queueing_finished(&self, id: MailingId) -> Result<(), DeliveryStoreError> {
        let result = sqlx::query(
            "UPDATE mailings SET queueing_finished = TRUE WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(DeliveryStoreError::NotFound);
        }
        Ok(())
    }
}
