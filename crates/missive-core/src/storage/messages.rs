//! Repository for individual message rows.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so overlapping delivery cycles
//! never select the same PENDING row, and flips the selection to PROCESSING
//! before the transaction commits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{BulkId, Message, MessageId, MessageStatus, NewMessage},
};

const MESSAGE_COLUMNS: &str = "id, sender, recipient, status, bulk_id, bulk_index, dt_store, \
                               dt_queue, dt_send, message, external_api_response, attempts, \
                               claimed_at";

/// Repository for individual message operations.
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

    /// Claims up to `limit` due PENDING messages, oldest `dt_queue` first.
    ///
    /// Select and status flip happen in one transaction. The transaction is
    /// committed even when nothing was selected.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails; nothing is claimed then.
    pub async fn claim_pending(
        &self,
        limit: usize,
        due_at: DateTime<Utc>,
        claimed_at: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM message
            WHERE status = $1
              AND dt_queue <= $2
            ORDER BY dt_queue ASC, id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(MessageStatus::Pending)
        .bind(due_at)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut messages = sqlx::query_as::<_, Message>(&format!(
            r#"
            UPDATE message
            SET status = $1, claimed_at = $2
            WHERE id = ANY($3)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(MessageStatus::Processing)
        .bind(claimed_at)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // RETURNING carries no order guarantee.
        messages.sort_by(|a, b| a.dt_queue.cmp(&b.dt_queue).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Inserts a PENDING message and returns its id.
    ///
    /// A message whose `(bulk_id, bulk_index)` already exists is not inserted
    /// again; the existing id is returned instead.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert(&self, message: &NewMessage) -> Result<MessageId> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO message (
                sender, recipient, status, bulk_id, bulk_index,
                dt_store, dt_queue, message
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8
            )
            ON CONFLICT (bulk_id, bulk_index) DO UPDATE SET bulk_id = EXCLUDED.bulk_id
            RETURNING id
            "#,
        )
        .bind(&message.sender)
        .bind(&message.recipient)
        .bind(MessageStatus::Pending)
        .bind(message.bulk_id)
        .bind(message.bulk_index)
        .bind(message.dt_store)
        .bind(message.dt_queue)
        .bind(&message.body)
        .fetch_one(&*self.pool)
        .await?;

        Ok(MessageId(id))
    }

    /// Records the outcome of a delivery attempt as SENT or FAILED.
    ///
    /// Only applies while the row is still PROCESSING under the claim taken
    /// at `claimed_at`. Returns whether a row was updated; `false` means the
    /// lease expired and the message was requeued or claimed again since.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_attempted(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
        status: MessageStatus,
        dt_send: DateTime<Utc>,
        response: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message
            SET status = $1,
                dt_send = $2,
                external_api_response = $3,
                attempts = attempts + 1,
                claimed_at = NULL
            WHERE id = $4 AND status = $5 AND claimed_at = $6
            "#,
        )
        .bind(status)
        .bind(dt_send)
        .bind(response)
        .bind(id)
        .bind(MessageStatus::Processing)
        .bind(claimed_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns a PROCESSING message to PENDING for another attempt.
    ///
    /// Same claim check as [`Repository::mark_attempted`].
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
        next_queue_at: DateTime<Utc>,
        response: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message
            SET status = $1,
                dt_queue = $2,
                dt_send = NULL,
                external_api_response = $3,
                attempts = attempts + 1,
                claimed_at = NULL
            WHERE id = $4 AND status = $5 AND claimed_at = $6
            "#,
        )
        .bind(MessageStatus::Pending)
        .bind(next_queue_at)
        .bind(response)
        .bind(id)
        .bind(MessageStatus::Processing)
        .bind(claimed_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Releases PROCESSING claims taken at `claimed_at` that were never
    /// attempted.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_claims(
        &self,
        ids: &[MessageId],
        claimed_at: DateTime<Utc>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();

        let result = sqlx::query(
            r#"
            UPDATE message
            SET status = $1, claimed_at = NULL
            WHERE id = ANY($2) AND status = $3 AND claimed_at = $4
            "#,
        )
        .bind(MessageStatus::Pending)
        .bind(&raw)
        .bind(MessageStatus::Processing)
        .bind(claimed_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Requeues PROCESSING messages whose lease started before `claimed_before`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE message
            SET status = $1, claimed_at = NULL, dt_send = NULL
            WHERE status = $2 AND claimed_at < $3
            "#,
        )
        .bind(MessageStatus::Pending)
        .bind(MessageStatus::Processing)
        .bind(claimed_before)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds a message by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(message)
    }

    /// Lists the messages expanded from an envelope, in recipient order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_bulk(&self, bulk_id: BulkId) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message WHERE bulk_id = $1 ORDER BY bulk_index ASC"
        ))
        .bind(bulk_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(messages)
    }

    /// Counts messages in a status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: MessageStatus) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM message WHERE status = $1")
            .bind(status)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count.0)
    }
}
