//! Postgres scheduler store.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use mailforge_core::{JobId, QueueEntryId};
use mailforge_scheduler::{
    EntryResolution, EntryStatus, FireRule, JobDefinition, JobFlag, QueueEntry, QueueStats,
    SchedulerStore, SchedulerStoreError,
};

/// Scheduler store over `scheduler_jobs` / `scheduler_queue` /
/// `scheduler_cycle`.
///
/// The claim is two statements: pick the oldest due queued row, then a
/// conditional `UPDATE ... WHERE status = 'queued'` that writes the claimant
/// in the same statement as the transition. A concurrent claimant that takes
/// the row between the two surfaces as `Contention`, which the engine
/// retries.
#[derive(Clone)]
pub struct PostgresSchedulerStore {
    pool: Arc<PgPool>,
}

impl PostgresSchedulerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn storage(e: sqlx::Error) -> SchedulerStoreError {
    SchedulerStoreError::Storage(e.to_string())
}

fn corrupt(what: &str, value: &str) -> SchedulerStoreError {
    SchedulerStoreError::Storage(format!("unreadable {what} '{value}'"))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<JobDefinition, SchedulerStoreError> {
    let flag: String = row.try_get("flag").map_err(storage)?;
    let rule: String = row.try_get("fire_rule").map_err(storage)?;
    Ok(JobDefinition {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id").map_err(storage)?),
        name: row.try_get("name").map_err(storage)?,
        flag: JobFlag::parse(&flag).ok_or_else(|| corrupt("job flag", &flag))?,
        rule: FireRule::from_str(&rule).map_err(|_| corrupt("fire rule", &rule))?,
        last_run: row.try_get("last_run").map_err(storage)?,
        requeue: row.try_get("requeue").map_err(storage)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(storage)? as u32,
        job_delay_secs: row.try_get::<i32, _>("job_delay_secs").map_err(storage)? as u32,
        created_at: row.try_get("created_at").map_err(storage)?,
        modified_at: row.try_get("modified_at").map_err(storage)?,
    })
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<QueueEntry, SchedulerStoreError> {
    let status: String = row.try_get("status").map_err(storage)?;
    let resolution: String = row.try_get("resolution").map_err(storage)?;
    Ok(QueueEntry {
        id: QueueEntryId::from_uuid(row.try_get::<Uuid, _>("id").map_err(storage)?),
        job_id: JobId::from_uuid(row.try_get::<Uuid, _>("job_id").map_err(storage)?),
        name: row.try_get("name").map_err(storage)?,
        status: EntryStatus::parse(&status).ok_or_else(|| corrupt("entry status", &status))?,
        resolution: EntryResolution::parse(&resolution)
            .ok_or_else(|| corrupt("entry resolution", &resolution))?,
        execute_time: row.try_get("execute_time").map_err(storage)?,
        client: row.try_get("client").map_err(storage)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(storage)? as u32,
        failure_count: row.try_get::<i32, _>("failure_count").map_err(storage)? as u32,
        message: row.try_get("message").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        modified_at: row.try_get("modified_at").map_err(storage)?,
    })
}

#[async_trait]
impl SchedulerStore for PostgresSchedulerStore {
    async fn upsert_job(&self, job: &JobDefinition) -> Result<(), SchedulerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_jobs
                (id, name, flag, fire_rule, last_run, requeue, retry_count,
                 job_delay_secs, created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                flag = EXCLUDED.flag,
                fire_rule = EXCLUDED.fire_rule,
                last_run = EXCLUDED.last_run,
                requeue = EXCLUDED.requeue,
                retry_count = EXCLUDED.retry_count,
                job_delay_secs = EXCLUDED.job_delay_secs,
                modified_at = EXCLUDED.modified_at
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(job.flag.as_str())
        .bind(job.rule.to_string())
        .bind(job.last_run)
        .bind(job.requeue)
        .bind(job.retry_count as i32)
        .bind(job.job_delay_secs as i32)
        .bind(job.created_at)
        .bind(job.modified_at)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobDefinition>, SchedulerStoreError> {
        let row = sqlx::query("SELECT * FROM scheduler_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<JobDefinition>, SchedulerStoreError> {
        let rows = sqlx::query("SELECT * FROM scheduler_jobs ORDER BY name")
            .fetch_all(&*self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn set_job_last_run(
        &self,
        id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerStoreError> {
        let result = sqlx::query(
            "UPDATE scheduler_jobs SET last_run = $2, modified_at = $2 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerStoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn has_pending_entry(&self, job_id: JobId) -> Result<bool, SchedulerStoreError> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM scheduler_queue WHERE job_id = $1 AND status <> 'done' LIMIT 1",
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(row.is_some())
    }

    async fn insert_entry(&self, entry: &QueueEntry) -> Result<(), SchedulerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_queue
                (id, job_id, name, status, resolution, execute_time, client,
                 retry_count, failure_count, message, created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.job_id.as_uuid())
        .bind(&entry.name)
        .bind(entry.status.as_str())
        .bind(entry.resolution.as_str())
        .bind(entry.execute_time)
        .bind(entry.client.as_deref())
        .bind(entry.retry_count as i32)
        .bind(entry.failure_count as i32)
        .bind(entry.message.as_deref())
        .bind(entry.created_at)
        .bind(entry.modified_at)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_entry(
        &self,
        id: QueueEntryId,
    ) -> Result<Option<QueueEntry>, SchedulerStoreError> {
        let row = sqlx::query("SELECT * FROM scheduler_queue WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn claim_oldest_due(
        &self,
        now: DateTime<Utc>,
        client: &str,
    ) -> Result<Option<QueueEntry>, SchedulerStoreError> {
        let candidate = sqlx::query(
            r#"
            SELECT id, name FROM scheduler_queue
            WHERE status = 'queued' AND execute_time <= $1
            ORDER BY execute_time, id
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage)?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let id: Uuid = candidate.try_get("id").map_err(storage)?;
        let name: String = candidate.try_get("name").map_err(storage)?;

        // Guarded transition: only wins if the row is still queued.
        let claimed = sqlx::query(
            r#"
            UPDATE scheduler_queue
            SET status = 'running', client = $2, modified_at = $3
            WHERE id = $1 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(client)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage)?;

        match claimed {
            Some(row) => Ok(Some(entry_from_row(&row)?)),
            None => Err(SchedulerStoreError::Contention(name)),
        }
    }

    async fn resolve_entry(
        &self,
        id: QueueEntryId,
        resolution: EntryResolution,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_queue
            SET status = 'done', resolution = $2, message = $3, modified_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(resolution.as_str())
        .bind(message)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerStoreError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn fail_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, SchedulerStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_queue
            SET status = 'done', resolution = 'failed',
                message = 'job timed out', modified_at = $2
            WHERE status = 'running' AND modified_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn purge_done_before(
        &self,
        success_cutoff: DateTime<Utc>,
        failure_cutoff: DateTime<Utc>,
    ) -> Result<u64, SchedulerStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM scheduler_queue
            WHERE status = 'done'
              AND modified_at < CASE resolution
                  WHEN 'success' THEN $1
                  ELSE $2
              END
            "#,
        )
        .bind(success_cutoff)
        .bind(failure_cutoff)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn last_cycle_at(&self) -> Result<Option<DateTime<Utc>>, SchedulerStoreError> {
        let row = sqlx::query("SELECT last_cycle_at FROM scheduler_cycle")
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage)?;
        row.map(|r| r.try_get("last_cycle_at").map_err(storage))
            .transpose()
    }

    async fn record_cycle(&self, at: DateTime<Utc>) -> Result<(), SchedulerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_cycle (singleton, last_cycle_at)
            VALUES (TRUE, $1)
            ON CONFLICT (singleton) DO UPDATE SET last_cycle_at = EXCLUDED.last_cycle_at
            "#,
        )
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn entry_stats(&self) -> Result<QueueStats, SchedulerStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, resolution, COUNT(*) AS n
            FROM scheduler_queue
            GROUP BY status, resolution
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(storage)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(storage)?;
            let resolution: String = row.try_get("resolution").map_err(storage)?;
            let n: i64 = row.try_get("n").map_err(storage)?;
            let n = n as usize;
            match (status.as_str(), resolution.as_str()) {
                ("queued", _) => stats.queued += n,
                ("running", _) => stats.running += n,
                ("done", "success") => stats.done_success += n,
                ("done", _) => stats.done_failed += n,
                _ => {}
            }
        }
        Ok(stats)
    }
}
