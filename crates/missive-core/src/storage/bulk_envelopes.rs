//! Repository for bulk envelope rows (`message_bulk`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{BulkEnvelope, BulkId, BulkStatus, NewEnvelope},
};

const ENVELOPE_COLUMNS: &str = "id, sender, status, dt_store, dt_convert, bulk, claimed_at";

/// Repository for bulk envelope operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Claims up to `limit` envelopes in PROCESS status.
    ///
    /// Claimed envelopes move to CLAIMED in the same transaction, so a
    /// concurrent cycle cannot pick them up again.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim(&self, limit: usize, claimed_at: DateTime<Utc>) -> Result<Vec<BulkEnvelope>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM message_bulk
            WHERE status = $1
            ORDER BY dt_store ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(BulkStatus::Process)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let envelopes = sqlx::query_as::<_, BulkEnvelope>(&format!(
            r#"
            UPDATE message_bulk
            SET status = $1, claimed_at = $2
            WHERE id = ANY($3)
            RETURNING {ENVELOPE_COLUMNS}
            "#
        ))
        .bind(BulkStatus::Claimed)
        .bind(claimed_at)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(envelopes)
    }

    /// Inserts an envelope in PROCESS status.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert(&self, envelope: &NewEnvelope) -> Result<BulkId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO message_bulk (sender, status, dt_store, bulk)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&envelope.sender)
        .bind(BulkStatus::Process)
        .bind(envelope.dt_store)
        .bind(sqlx::types::Json(&envelope.payload))
        .fetch_one(&*self.pool)
        .await?;

        Ok(BulkId(id))
    }

    /// Moves a CLAIMED envelope to a terminal status.
    ///
    /// Returns whether a row was updated; terminal envelopes are never
    /// touched again.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn finish(
        &self,
        id: BulkId,
        status: BulkStatus,
        dt_convert: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_bulk
            SET status = $1, dt_convert = $2, claimed_at = NULL
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(status)
        .bind(dt_convert)
        .bind(id)
        .bind(BulkStatus::Claimed)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns CLAIMED envelopes with an expired lease to PROCESS.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE message_bulk
            SET status = $1, claimed_at = NULL
            WHERE status = $2 AND claimed_at < $3
            "#,
        )
        .bind(BulkStatus::Process)
        .bind(BulkStatus::Claimed)
        .bind(claimed_before)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds an envelope by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: BulkId) -> Result<Option<BulkEnvelope>> {
        let envelope = sqlx::query_as::<_, BulkEnvelope>(&format!(
            "SELECT {ENVELOPE_COLUMNS} FROM message_bulk WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(envelope)
    }
}
