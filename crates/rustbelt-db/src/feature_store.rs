//! Features, their hex membership, and the road decay pass.

use std::collections::BTreeMap;

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use rustbelt_types::{Feature, FeatureId, FeatureState};
use rustbelt_world::DecayOutcome;

use crate::error::DbError;
use crate::rows::{FeatureRow, FeatureStateRow, decode_all};

/// A road whose health changed in a decay pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayedRoad {
    /// The road.
    pub feature_id: FeatureId,
    /// State before the pass.
    pub before: FeatureState,
    /// What the pass did to it.
    pub outcome: DecayOutcome,
}

/// Operations on `features`, `feature_hexes` and `feature_state`.
pub struct FeatureStore<'a> {
    pool: &'a PgPool,
}

impl<'a> FeatureStore<'a> {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Every feature with its hexes in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn load_features(&self) -> Result<Vec<Feature>, DbError> {
        let rows = sqlx::query_as::<_, FeatureRow>(
            r"SELECT f.id, f.region_id, f.kind, f.road_class, f.lon, f.lat, f.generates_resources,
                     COALESCE(array_agg(fh.hex_id ORDER BY fh.ordinal)
                              FILTER (WHERE fh.hex_id IS NOT NULL), '{}') AS hexes
              FROM features f
              LEFT JOIN feature_hexes fh ON fh.feature_id = f.id
              GROUP BY f.id
              ORDER BY f.id",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(decode_all(rows))
    }

    /// Current state of every feature.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn load_states(&self) -> Result<BTreeMap<FeatureId, FeatureState>, DbError> {
        let rows = sqlx::query_as::<_, FeatureStateRow>("SELECT feature_id, health, status FROM feature_state")
            .fetch_all(self.pool)
            .await?;
        Ok(decode_states(rows))
    }

    /// Run one decay pass over roads not under repair.
    ///
    /// Road states are locked with `FOR UPDATE SKIP LOCKED`, so a road a
    /// crew is finishing right now is left alone this tick. `decide` gets
    /// each locked road and returns its outcome; every road whose health
    /// moved is written back in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails.
    pub async fn decay_pass<F>(&self, mut decide: F) -> Result<Vec<DecayedRoad>, DbError>
    where
        F: FnMut(FeatureId, FeatureState) -> Option<DecayOutcome> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, FeatureStateRow>(
            r"SELECT fs.feature_id, fs.health, fs.status
              FROM feature_state fs
              JOIN features f ON f.id = fs.feature_id
              WHERE f.kind = 'road' AND fs.status <> 'repairing'
              ORDER BY fs.feature_id
              FOR UPDATE OF fs SKIP LOCKED",
        )
        .fetch_all(&mut *tx)
        .await?;

        let decayed: Vec<DecayedRoad> = decode_states(rows)
            .into_iter()
            .filter_map(|(feature_id, before)| {
                let outcome = decide(feature_id, before)?;
                (outcome.state != before).then_some(DecayedRoad {
                    feature_id,
                    before,
                    outcome,
                })
            })
            .collect();

        let writes: Vec<(FeatureId, FeatureState)> = decayed.iter().map(|d| (d.feature_id, d.outcome.state)).collect();
        write_states(&mut tx, &writes).await?;
        tx.commit().await?;

        tracing::debug!(changed = decayed.len(), "road decay pass written");
        Ok(decayed)
    }
}

fn decode_states(rows: Vec<FeatureStateRow>) -> BTreeMap<FeatureId, FeatureState> {
    rows.into_iter()
        .filter_map(|row| match row.state() {
            Ok(state) => Some((FeatureId::from(row.feature_id), state)),
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable feature state");
                None
            }
        })
        .collect()
}

/// Write feature states in one statement.
pub(crate) async fn write_states(conn: &mut PgConnection, states: &[(FeatureId, FeatureState)]) -> Result<(), DbError> {
    if states.is_empty() {
        return Ok(());
    }
    let ids: Vec<Uuid> = states.iter().map(|(id, _)| id.into_inner()).collect();
    let health: Vec<f64> = states.iter().map(|(_, s)| s.health).collect();
    let status: Vec<&str> = states.iter().map(|(_, s)| s.status.as_str()).collect();
    sqlx::query(
        r"UPDATE feature_state fs SET health = u.health, status = u.status
          FROM UNNEST($1::UUID[], $2::DOUBLE PRECISION[], $3::TEXT[]) AS u(feature_id, health, status)
          WHERE fs.feature_id = u.feature_id",
    )
    .bind(&ids)
    .bind(&health)
    .bind(&status)
    .execute(conn)
    .await?;
    Ok(())
}

/// Lock and read one feature's state.
pub(crate) async fn lock_state(conn: &mut PgConnection, feature_id: FeatureId) -> Result<Option<FeatureState>, DbError> {
    let row = sqlx::query_as::<_, FeatureStateRow>(
        "SELECT feature_id, health, status FROM feature_state WHERE feature_id = $1 FOR UPDATE",
    )
    .bind(feature_id.into_inner())
    .fetch_optional(conn)
    .await?;
    row.map(|r| r.state()).transpose()
}
