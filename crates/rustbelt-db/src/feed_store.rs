//! Feed event persistence.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use rustbelt_types::FeedEvent;

use crate::error::DbError;

/// Operations on the `feed_events` table.
pub struct FeedStore<'a> {
    pool: &'a PgPool,
}

impl<'a> FeedStore<'a> {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert a batch of events using UNNEST.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn insert_batch(&self, events: &[FeedEvent]) -> Result<u64, DbError> {
        if events.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = events.iter().map(|e| e.id.into_inner()).collect();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        let regions: Vec<Option<Uuid>> = events.iter().map(|e| e.region_id.map(Into::into)).collect();
        let subjects: Vec<Option<Uuid>> = events.iter().map(|e| e.subject_id).collect();
        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        let occurred: Vec<DateTime<Utc>> = events.iter().map(|e| e.occurred_at).collect();

        let result = sqlx::query(
            r"INSERT INTO feed_events (id, kind, region_id, subject_id, message, occurred_at)
              SELECT * FROM UNNEST($1::UUID[], $2::TEXT[], $3::UUID[], $4::UUID[], $5::TEXT[], $6::TIMESTAMPTZ[])
              ON CONFLICT (id) DO NOTHING",
        )
        .bind(&ids)
        .bind(&kinds)
        .bind(&regions)
        .bind(&subjects)
        .bind(&messages)
        .bind(&occurred)
        .execute(self.pool)
        .await?;

        tracing::debug!(count = result.rows_affected(), "feed events persisted");
        Ok(result.rows_affected())
    }

    /// The most recent events, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn recent(&self, limit: i64) -> Result<Vec<(String, String, DateTime<Utc>)>, DbError> {
        let rows = sqlx::query_as(
            "SELECT kind, message, occurred_at FROM feed_events ORDER BY occurred_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        Ok(rows)
    }
}
