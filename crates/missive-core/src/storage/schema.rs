//! Idempotent schema bootstrap.
//!
//! Creates the two tables of record and their claim indexes if they do not
//! exist yet. There is no migration tooling beyond this.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS message_bulk (
        id BIGSERIAL PRIMARY KEY,
        sender TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'PROCESS',
        dt_store TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        dt_convert TIMESTAMPTZ,
        bulk JSONB NOT NULL,
        claimed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message (
        id BIGSERIAL PRIMARY KEY,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        bulk_id BIGINT REFERENCES message_bulk(id),
        bulk_index INTEGER,
        dt_store TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        dt_queue TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        dt_send TIMESTAMPTZ,
        message TEXT NOT NULL,
        external_api_response TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        claimed_at TIMESTAMPTZ,
        UNIQUE (bulk_id, bulk_index)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_message_pending
    ON message(dt_queue, id)
    WHERE status = 'PENDING'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_message_processing
    ON message(claimed_at)
    WHERE status = 'PROCESSING'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_message_bulk_status
    ON message_bulk(status, dt_store)
    WHERE status IN ('PROCESS', 'CLAIMED')
    "#,
];

/// Creates tables and indexes that are missing.
///
/// # Errors
///
/// Returns `CoreError::Database` on the first statement that fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
