//! Global tick lock on a `PostgreSQL` session advisory lock.
//!
//! Session advisory locks belong to the connection that took them, so the
//! connection is pinned out of the pool for as long as the lock is held
//! and handed back on release. If unlocking fails the connection is closed
//! instead of returned, which drops the lock with the session.

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;

use crate::error::DbError;

/// Cross-process mutual exclusion for tick bodies.
#[derive(Debug)]
pub struct TickLock {
    pool: PgPool,
    lock_id: i64,
    held: Mutex<Option<PoolConnection<Postgres>>>,
}

impl TickLock {
    /// A lock on advisory key `lock_id`.
    pub fn new(pool: PgPool, lock_id: i64) -> Self {
        Self {
            pool,
            lock_id,
            held: Mutex::new(None),
        }
    }

    /// The advisory key.
    pub const fn lock_id(&self) -> i64 {
        self.lock_id
    }

    /// Try to take the lock without waiting.
    ///
    /// Returns `false` if another session holds it, or if this handle
    /// already does.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if no connection could be acquired or
    /// the query failed.
    pub async fn try_acquire(&self) -> Result<bool, DbError> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_id)
            .fetch_one(&mut *conn)
            .await?;

        if acquired {
            *held = Some(conn);
        }
        Ok(acquired)
    }

    /// Release the lock if held. A no-op otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the unlock query failed; the
    /// connection is closed in that case so the lock still goes away.
    pub async fn release(&self) -> Result<(), DbError> {
        let Some(mut conn) = self.held.lock().await.take() else {
            return Ok(());
        };

        match sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_id)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(lock_id = self.lock_id, "advisory lock was not held by the pinned session");
                Ok(())
            }
            Err(e) => {
                conn.close_on_drop();
                Err(e.into())
            }
        }
    }

    /// Whether this handle currently holds the lock.
    pub async fn is_held(&self) -> bool {
        self.held.lock().await.is_some()
    }
}
