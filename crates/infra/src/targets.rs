//! Postgres target provider.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use mailforge_campaigns::{SuppressionLists, TargetKind, TargetRef};
use mailforge_core::{CampaignId, ListId, Record, TargetId};
use mailforge_delivery::{DeliveryStoreError, TargetProvider};

/// Target provider over `campaign_targets` / `target_records` /
/// `campaign_suppression`.
///
/// `campaign_targets` is the flattened membership set (prospect lists, users,
/// static addresses) with the queueing progress bit; `target_records` keeps
/// the provider-shaped attribute maps as JSONB.
#[derive(Clone)]
pub struct PostgresTargetProvider {
    pool: Arc<PgPool>,
}

impl PostgresTargetProvider {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn storage(e: sqlx::Error) -> DeliveryStoreError {
    DeliveryStoreError::Storage(e.to_string())
}

#[async_trait]
impl TargetProvider for PostgresTargetProvider {
    async fn next_targets(
        &self,
        campaign_id: CampaignId,
        batch: usize,
    ) -> Result<Vec<TargetRef>, DeliveryStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT target_id, target_kind, list_id FROM campaign_targets
            WHERE campaign_id = $1 AND NOT evaluated AND NOT deleted
            ORDER BY target_id
            LIMIT $2
            "#,
        )
        .bind(campaign_id.as_uuid())
        .bind(batch as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("target_kind").map_err(storage)?;
                Ok(TargetRef {
                    target_id: TargetId::from_uuid(
                        row.try_get::<Uuid, _>("target_id").map_err(storage)?,
                    ),
                    kind: TargetKind::from_str(&kind)
                        .map_err(|e| DeliveryStoreError::Storage(e.to_string()))?,
                    list_id: row
                        .try_get::<Option<Uuid>, _>("list_id")
                        .map_err(storage)?
                        .map(ListId::from_uuid),
                })
            })
            .collect()
    }

    async fn remaining(&self, campaign_id: CampaignId) -> Result<u64, DeliveryStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM campaign_targets
            WHERE campaign_id = $1 AND NOT evaluated AND NOT deleted
            "#,
        )
        .bind(campaign_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(storage)?;
        let n: i64 = row.try_get("n").map_err(storage)?;
        Ok(n as u64)
    }

    async fn mark_evaluated(
        &self,
        campaign_id: CampaignId,
        target_id: TargetId,
    ) -> Result<(), DeliveryStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_targets SET evaluated = TRUE
            WHERE campaign_id = $1 AND target_id = $2
            "#,
        )
        .bind(campaign_id.as_uuid())
        .bind(target_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(DeliveryStoreError::NotFound);
        }
        Ok(())
    }

    async fn load(
        &self,
        _kind: TargetKind,
        target_id: TargetId,
    ) -> Result<Option<Record>, DeliveryStoreError> {
        let Some(row) = sqlx::query("SELECT module, fields FROM target_records WHERE id = $1")
            .bind(target_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage)?
        else {
            return Ok(None);
        };

        let module: String = row.try_get("module").map_err(storage)?;
        let fields: Value = row.try_get("fields").map_err(storage)?;

        let mut record = Record::new(module, target_id.to_string());
        if let Value::Object(map) = fields {
            for (field, value) in map {
                record.set(field, value);
            }
        }
        Ok(Some(record))
    }

    async fn suppression(
        &self,
        campaign_id: CampaignId,
    ) -> Result<SuppressionLists, DeliveryStoreError> {
        let rows = sqlx::query(
            "SELECT kind, value FROM campaign_suppression WHERE campaign_id = $1",
        )
        .bind(campaign_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage)?;

        let mut lists = SuppressionLists::default();
        for row in rows {
            let kind: String = row.try_get("kind").map_err(storage)?;
            let value: String = row.try_get("value").map_err(storage)?;
            match kind.as_str() {
                "domain" => lists.suppress_domain(value),
                "address" => lists.suppress_address(value),
                "target" => {
                    let id = Uuid::from_str(&value).map_err(|e| {
                        DeliveryStoreError::Storage(format!(
                            "suppressed target '{value}' is not a uuid: {e}"
                        ))
                    })?;
                    lists.suppress_target(TargetId::from_uuid(id));
                }
                other => {
                    return Err(DeliveryStoreError::Storage(format!(
                        "unknown suppression kind '{other}'"
                    )));
                }
            }
        }
        Ok(lists)
    }
}
