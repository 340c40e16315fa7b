//! PostgreSQL access layer for the two tables of record.
//!
//! All SQL lives in these repositories. Workers reach the store through the
//! `QueueStorage` seam in `missive-queue`, whose Postgres adapter delegates
//! here.

use std::sync::Arc;

use sqlx::PgPool;

pub mod bulk_envelopes;
pub mod messages;
pub mod schema;

use crate::error::Result;

/// Container for the repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Individual message operations.
    pub messages: Arc<messages::Repository>,

    /// Bulk envelope operations.
    pub bulk_envelopes: Arc<bulk_envelopes::Repository>,
}

impl Storage {
    /// Creates the repositories over a shared pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            messages: Arc::new(messages::Repository::new(pool.clone())),
            bulk_envelopes: Arc::new(bulk_envelopes::Repository::new(pool)),
        }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.messages.pool()
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool()).await?;

        Ok(())
    }
}
