//! Database connection and schema.

use sqlx::PgPool;
use tracing::info;

/// Per-statement schema, applied in order by [`migrate`]. Statements are
/// idempotent so running the binary against an initialized database is safe.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_jobs (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        flag TEXT NOT NULL,
        fire_rule TEXT NOT NULL,
        last_run TIMESTAMPTZ,
        requeue BOOLEAN NOT NULL DEFAULT FALSE,
        retry_count INTEGER NOT NULL DEFAULT 0,
        job_delay_secs INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        modified_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_queue (
        id UUID PRIMARY KEY,
        job_id UUID NOT NULL REFERENCES scheduler_jobs(id),
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        resolution TEXT NOT NULL,
        execute_time TIMESTAMPTZ NOT NULL,
        client TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        failure_count INTEGER NOT NULL DEFAULT 0,
        message TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        modified_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_scheduler_queue_claim
        ON scheduler_queue (status, execute_time)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_cycle (
        singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
        last_cycle_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mailings (
        id UUID PRIMARY KEY,
        campaign_id UUID NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        queueing_finished BOOLEAN NOT NULL DEFAULT FALSE,
        send_date TIMESTAMPTZ NOT NULL,
        outbound_account UUID,
        subject TEXT NOT NULL DEFAULT '',
        body_html TEXT NOT NULL DEFAULT '',
        body_text TEXT NOT NULL DEFAULT '',
        all_prospect_lists BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        modified_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS email_queue (
        id UUID PRIMARY KEY,
        campaign_id UUID NOT NULL,
        mailing_id UUID NOT NULL,
        list_id UUID,
        target_id UUID NOT NULL,
        target_kind TEXT NOT NULL,
        send_attempts INTEGER NOT NULL DEFAULT 0,
        send_date_time TIMESTAMPTZ NOT NULL,
        in_queue BOOLEAN NOT NULL DEFAULT FALSE,
        in_queue_at TIMESTAMPTZ,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    // One live row per (mailing, target, kind); soft-deleted rows don't count.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_email_queue_live
        ON email_queue (mailing_id, target_id, target_kind)
        WHERE NOT deleted
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_email_queue_due
        ON email_queue (mailing_id, send_date_time)
        WHERE NOT deleted
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS campaign_log (
        id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        campaign_id UUID NOT NULL,
        mailing_id UUID NOT NULL,
        email TEXT NOT NULL,
        activity_type TEXT NOT NULL,
        list_id UUID,
        target_id UUID NOT NULL,
        target_kind TEXT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_campaign_log_campaign
        ON campaign_log (campaign_id, id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_campaign_log_target
        ON campaign_log (mailing_id, target_id, activity_type)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS campaign_targets (
        campaign_id UUID NOT NULL,
        target_id UUID NOT NULL,
        target_kind TEXT NOT NULL,
        list_id UUID,
        evaluated BOOLEAN NOT NULL DEFAULT FALSE,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (campaign_id, target_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS target_records (
        id UUID PRIMARY KEY,
        module TEXT NOT NULL,
        fields JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS campaign_suppression (
        campaign_id UUID NOT NULL,
        kind TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (campaign_id, kind, value)
    )
    "#,
];

/// Connect a Postgres pool to `database_url`.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPool::connect(database_url).await
}

/// Apply the embedded schema to `pool`.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "schema applied");
    Ok(())
}
