//! Housekeeping: crew roster sync, orphan recovery, retention deletes and
//! world reset.

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use rustbelt_types::{Crew, CrewId, CrewState, FeatureId, FeatureState, FeatureStatus, ResourceAmounts};
use rustbelt_world::decay::status_for_health;
use rustbelt_world::{CrewParams, DecayParams, crew};

use crate::crew_store::{CREW_COLUMNS, CrewPlan, hub_of, write_crew};
use crate::error::DbError;
use crate::feature_store::write_states;
use crate::rows::{CrewRow, FeatureStateRow, decode_all};

/// World-metadata key of the reset marker.
const LAST_RESET_KEY: &str = "last_reset";

/// Crews created and removed by a roster sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterChange {
    /// Idle crews created at a hub.
    pub added: u64,
    /// Idle crews removed.
    pub removed: u64,
}

/// Rows removed by retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionCounts {
    /// Feed events.
    pub feed: u64,
    /// Arrived transfers.
    pub transfers: u64,
    /// Done tasks (their votes go with them).
    pub tasks: u64,
}

/// Age limits for [`Maintenance::delete_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionCutoffs {
    /// Feed events that occurred before this are deleted.
    pub feed: DateTime<Utc>,
    /// Arrived transfers due before this are deleted.
    pub transfers: DateTime<Utc>,
    /// Done tasks completed before this are deleted.
    pub tasks: DateTime<Utc>,
    /// Per-statement time box in milliseconds.
    pub statement_timeout_ms: u64,
}

/// Baseline values a reset restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetValues {
    /// Pools every region gets.
    pub pools: ResourceAmounts,
    /// Reset time, recorded in world metadata.
    pub at: DateTime<Utc>,
}

/// Cross-table maintenance operations.
pub struct Maintenance<'a> {
    pool: &'a PgPool,
}

impl<'a> Maintenance<'a> {
    /// Create a handle bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Bring every region's crew count to its target.
    ///
    /// The target is derived from the region's hex count. Missing crews
    /// are created idle at the hub; surplus crews are removed only while
    /// idle, so a short region shrinks over several ticks as crews return.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails.
    pub async fn sync_roster(&self, params: &CrewParams) -> Result<RosterChange, DbError> {
        let mut tx = self.pool.begin().await?;
        let regions: Vec<(Uuid, f64, f64, i64, i64)> = sqlx::query_as(
            r"SELECT r.id, r.hub_lon, r.hub_lat,
                     (SELECT COUNT(*) FROM hex_cells h WHERE h.region_id = r.id) AS hexes,
                     (SELECT COUNT(*) FROM crews c WHERE c.region_id = r.id) AS crews
              FROM regions r
              ORDER BY r.id
              FOR UPDATE OF r",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut change = RosterChange::default();
        for (region_id, hub_lon, hub_lat, hexes, crews) in regions {
            let target = crew::target_crew_count(u32::try_from(hexes).unwrap_or(u32::MAX), params);
            sqlx::query("UPDATE regions SET target_crews = $2 WHERE id = $1 AND target_crews <> $2")
                .bind(region_id)
                .bind(i32::try_from(target).unwrap_or(i32::MAX))
                .execute(&mut *tx)
                .await?;

            let target = i64::from(target);
            if crews < target {
                let ids: Vec<Uuid> = (crews..target).map(|_| CrewId::new().into_inner()).collect();
                let added = sqlx::query(
                    r"INSERT INTO crews (id, region_id, status, lon, lat)
                      SELECT id, $2, 'idle', $3, $4 FROM UNNEST($1::UUID[]) AS u(id)",
                )
                .bind(&ids)
                .bind(region_id)
                .bind(hub_lon)
                .bind(hub_lat)
                .execute(&mut *tx)
                .await?;
                change.added = change.added.saturating_add(added.rows_affected());
            } else if crews > target {
                let removed = sqlx::query(
                    r"DELETE FROM crews WHERE id IN (
                          SELECT id FROM crews
                          WHERE region_id = $1 AND status = 'idle'
                          ORDER BY id
                          LIMIT $2
                          FOR UPDATE SKIP LOCKED)",
                )
                .bind(region_id)
                .bind(crews - target)
                .execute(&mut *tx)
                .await?;
                change.removed = change.removed.saturating_add(removed.rows_affected());
            }
        }
        tx.commit().await?;

        if change != RosterChange::default() {
            tracing::info!(added = change.added, removed = change.removed, "crew roster synced");
        }
        Ok(change)
    }

    /// Put active tasks that no crew references back in the queue.
    ///
    /// A road left in `repairing` by such a task gets the status its
    /// health implies.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails.
    pub async fn requeue_orphans(&self, decay: &DecayParams) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;
        let features: Vec<Uuid> = sqlx::query_scalar(
            r"UPDATE tasks t SET status = 'queued'
              WHERE t.status = 'active'
                AND NOT EXISTS (SELECT 1 FROM crews c WHERE c.active_task_id = t.id)
              RETURNING t.feature_id",
        )
        .fetch_all(&mut *tx)
        .await?;
        if features.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let rows = sqlx::query_as::<_, FeatureStateRow>(
            r"SELECT feature_id, health, status FROM feature_state
              WHERE feature_id = ANY($1) AND status = 'repairing'
              FOR UPDATE",
        )
        .bind(&features)
        .fetch_all(&mut *tx)
        .await?;
        let restored: Vec<(FeatureId, FeatureState)> = rows
            .iter()
            .map(|row| {
                (
                    FeatureId::from(row.feature_id),
                    FeatureState {
                        health: row.health,
                        status: status_for_health(row.health, decay),
                    },
                )
            })
            .collect();
        write_states(&mut tx, &restored).await?;
        tx.commit().await?;

        let count = u64::try_from(features.len()).unwrap_or(u64::MAX);
        tracing::info!(count, "orphaned tasks requeued");
        Ok(count)
    }

    /// Send home every crew whose task is missing or no longer active.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails.
    pub async fn recall_stranded(&self, plan: &CrewPlan<'_>) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, CrewRow>(&format!(
            r"SELECT {CREW_COLUMNS} FROM crews c
              WHERE c.status IN ('traveling', 'working')
                AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.id = c.active_task_id AND t.status = 'active')
              ORDER BY c.id
              FOR UPDATE SKIP LOCKED"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let stranded: Vec<Crew> = decode_all(rows);

        for crew in &stranded {
            let hub = hub_of(&mut tx, crew.region_id).await?.unwrap_or(crew.position);
            let travel = plan.travel_secs(crew.region_id, crew.position, hub);
            let recalled = Crew {
                state: CrewState::Returning {
                    busy_until: plan.now + Duration::seconds(travel),
                },
                ..*crew
            };
            write_crew(&mut tx, &recalled).await?;
        }
        tx.commit().await?;

        let count = u64::try_from(stranded.len()).unwrap_or(u64::MAX);
        if count > 0 {
            tracing::info!(count, "stranded crews recalled");
        }
        Ok(count)
    }

    /// Delete feed events, arrived transfers and done tasks past their
    /// retention windows.
    ///
    /// Each delete runs in its own transaction under a local statement
    /// timeout. A delete that times out or fails is logged and counted as
    /// zero; the others still run. Transfers are skipped when their table
    /// is absent.
    pub async fn delete_expired(&self, cutoffs: &RetentionCutoffs, transfers_present: bool) -> RetentionCounts {
        let feed = self
            .timed_delete(
                "feed_events",
                "DELETE FROM feed_events WHERE occurred_at < $1",
                cutoffs.feed,
                cutoffs.statement_timeout_ms,
            )
            .await;
        let transfers = if transfers_present {
            self.timed_delete(
                "resource_transfers",
                "DELETE FROM resource_transfers WHERE status = 'arrived' AND arrives_at < $1",
                cutoffs.transfers,
                cutoffs.statement_timeout_ms,
            )
            .await
        } else {
            0
        };
        let tasks = self
            .timed_delete(
                "tasks",
                r"DELETE FROM tasks t
                  WHERE t.status = 'done' AND t.completed_at < $1
                    AND NOT EXISTS (SELECT 1 FROM crews c WHERE c.active_task_id = t.id)",
                cutoffs.tasks,
                cutoffs.statement_timeout_ms,
            )
            .await;

        let counts = RetentionCounts { feed, transfers, tasks };
        tracing::debug!(?counts, "retention cleanup done");
        counts
    }

    async fn timed_delete(&self, table: &str, sql: &str, cutoff: DateTime<Utc>, timeout_ms: u64) -> u64 {
        match run_timed(self.pool, sql, cutoff, timeout_ms).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(table, error = %e, "retention delete skipped");
                0
            }
        }
    }

    /// Restore the world to its starting state in one transaction.
    ///
    /// Crews are sent home first so no row references a task when tasks
    /// are deleted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails; nothing is
    /// changed in that case.
    pub async fn reset_world(&self, values: &ResetValues, transfers_present: bool) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"UPDATE crews c
              SET status = 'idle', active_task_id = NULL, busy_until = NULL,
                  dest_lon = NULL, dest_lat = NULL, lon = r.hub_lon, lat = r.hub_lat
              FROM regions r
              WHERE r.id = c.region_id",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM votes").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM tasks").execute(&mut *tx).await?;
        if transfers_present {
            sqlx::query("DELETE FROM resource_transfers").execute(&mut *tx).await?;
        }
        sqlx::query("DELETE FROM feed_events").execute(&mut *tx).await?;
        sqlx::query("UPDATE feature_state SET health = 100, status = $1")
            .bind(FeatureStatus::Normal.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE hex_cells SET rust_level = CASE WHEN center_rank = 0 THEN 0 ELSE baseline_rust END")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r"UPDATE regions
              SET pool_food = $1, pool_equipment = $2, pool_energy = $3, pool_materials = $4",
        )
        .bind(values.pools.food)
        .bind(values.pools.equipment)
        .bind(values.pools.energy)
        .bind(values.pools.materials)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r"INSERT INTO world_meta (key, value, updated_at)
              VALUES ($1, $2, $3)
              ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .bind(LAST_RESET_KEY)
        .bind(serde_json::json!({ "at": values.at }))
        .bind(values.at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(at = %values.at, "world reset");
        Ok(())
    }
}

async fn run_timed(pool: &PgPool, sql: &str, cutoff: DateTime<Utc>, timeout_ms: u64) -> Result<u64, DbError> {
    let mut tx = pool.begin().await?;
    set_local_timeout(&mut tx, timeout_ms).await?;
    let result = sqlx::query(sql).bind(cutoff).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

/// `SET LOCAL statement_timeout` for the rest of the transaction.
async fn set_local_timeout(conn: &mut PgConnection, timeout_ms: u64) -> Result<(), DbError> {
    sqlx::query("SELECT set_config('statement_timeout', $1, true)")
        .bind(format!("{timeout_ms}ms"))
        .execute(conn)
        .await?;
    Ok(())
}

