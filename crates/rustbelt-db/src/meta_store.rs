//! Keyed JSON blobs in `world_meta` (cycle record, reset marker).

use sqlx::PgPool;

use crate::error::DbError;

/// Operations on the `world_meta` table.
pub struct MetaStore<'a> {
    pool: &'a PgPool,
}

impl<'a> MetaStore<'a> {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// The blob stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, DbError> {
        let value = sqlx::query_scalar::<_, serde_json::Value>("SELECT value FROM world_meta WHERE key = $1")
            .bind(key)
            .fetch_optional(self.pool)
            .await?;
        Ok(value)
    }

    /// Insert or replace the blob under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO world_meta (key, value, updated_at)
              VALUES ($1, $2, now())
              ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Serialize and store `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] or [`DbError::Postgres`].
    pub async fn put_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), DbError> {
        let value = serde_json::to_value(value)?;
        self.put(key, &value).await
    }
}
