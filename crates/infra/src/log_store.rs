//! Postgres campaign log.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use mailforge_campaigns::{Activity, CampaignLogEntry, TargetKind};
use mailforge_core::{CampaignId, ListId, MailingId, TargetId};
use mailforge_delivery::{CampaignLogStore, DeliveryStoreError};

/// Append-only ledger over the `campaign_log` table.
#[derive(Clone)]
pub struct PostgresCampaignLog {
    pool: Arc<PgPool>,
}

impl PostgresCampaignLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn storage(e: sqlx::Error) -> DeliveryStoreError {
    DeliveryStoreError::Storage(e.to_string())
}

fn log_from_row(row: &sqlx::postgres::PgRow) -> Result<CampaignLogEntry, DeliveryStoreError> {
    let label: String = row.try_get("activity_type").map_err(storage)?;
    let kind: String = row.try_get("target_kind").map_err(storage)?;
    Ok(CampaignLogEntry {
        campaign_id: CampaignId::from_uuid(row.try_get::<Uuid, _>("campaign_id").map_err(storage)?),
        mailing_id: MailingId::from_uuid(row.try_get::<Uuid, _>("mailing_id").map_err(storage)?),
        email: row.try_get("email").map_err(storage)?,
        activity: Activity::from_label(&label)
            .ok_or_else(|| DeliveryStoreError::Storage(format!("unknown activity '{label}'")))?,
        list_id: row
            .try_get::<Option<Uuid>, _>("list_id")
            .map_err(storage)?
            .map(ListId::from_uuid),
        target_id: TargetId::from_uuid(row.try_get::<Uuid, _>("target_id").map_err(storage)?),
        target_kind: TargetKind::from_str(&kind)
            .map_err(|e| DeliveryStoreError::Storage(e.to_string()))?,
        occurred_at: row.try_get("occurred_at").map_err(storage)?,
    })
}

#[async_trait]
impl CampaignLogStore for PostgresCampaignLog {
    async fn append(&self, entry: CampaignLogEntry) -> Result<(), DeliveryStoreError> {
        sqlx::query(
            r#"
            INSERT INTO campaign_log
                (campaign_id, mailing_id, email, activity_type, list_id,
                 target_id, target_kind, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.campaign_id.as_uuid())
        .bind(entry.mailing_id.as_uuid())
        .bind(&entry.email)
        .bind(entry.activity.label())
        .bind(entry.list_id.map(|l| *l.as_uuid()))
        .bind(entry.target_id.as_uuid())
        .bind(entry.target_kind.as_str())
        .bind(entry.occurred_at)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn for_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<CampaignLogEntry>, DeliveryStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM campaign_log WHERE campaign_id = $1 ORDER BY id",
        )
        .bind(campaign_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(log_from_row).collect()
    }

    async fn has_activity(
        &self,
        mailing_id: MailingId,
        target_id: TargetId,
        activity: Activity,
    ) -> Result<bool, DeliveryStoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM campaign_log
                WHERE mailing_id = $1 AND target_id = $2 AND activity_type = $3
            ) AS present
            "#,
        )
        .bind(mailing_id.as_uuid())
        .bind(target_id.as_uuid())
        .bind(activity.label())
        .fetch_one(&*self.pool)
        .await
        .map_err(storage)?;
        row.try_get("present").map_err(storage)
    }
}
