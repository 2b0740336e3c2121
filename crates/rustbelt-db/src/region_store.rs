//! Region reads and pool updates.

use sqlx::{PgConnection, PgPool};

use rustbelt_types::{Region, RegionId, ResourceAmounts};

use crate::error::DbError;
use crate::rows::{RegionRow, decode_all};

pub(crate) const REGION_COLUMNS: &str = "id, name, hub_lon, hub_lat, pool_food, pool_equipment, pool_energy, \
                                         pool_materials, target_crews, difficulty_multiplier";

/// Operations on the `regions` table.
pub struct RegionStore<'a> {
    pool: &'a PgPool,
}

impl<'a> RegionStore<'a> {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Every region.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn load_all(&self) -> Result<Vec<Region>, DbError> {
        let rows = sqlx::query_as::<_, RegionRow>(&format!("SELECT {REGION_COLUMNS} FROM regions ORDER BY id"))
            .fetch_all(self.pool)
            .await?;
        Ok(decode_all(rows))
    }

    /// Set every region's pools to `pools`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the update fails.
    pub async fn set_all_pools(&self, pools: &ResourceAmounts) -> Result<u64, DbError> {
        let result = sqlx::query(
            r"UPDATE regions
              SET pool_food = $1, pool_equipment = $2, pool_energy = $3, pool_materials = $4",
        )
        .bind(pools.food)
        .bind(pools.equipment)
        .bind(pools.energy)
        .bind(pools.materials)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Lock one region row for the rest of the transaction.
pub(crate) async fn lock_region(conn: &mut PgConnection, region_id: RegionId) -> Result<Option<RegionRow>, DbError> {
    let row = sqlx::query_as::<_, RegionRow>(&format!("SELECT {REGION_COLUMNS} FROM regions WHERE id = $1 FOR UPDATE"))
        .bind(region_id.into_inner())
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

/// Debit `costs` from a region if every pool covers it.
///
/// Returns the pools after the debit, or `None` when any pool is short.
/// The guard in the `WHERE` clause keeps pools non-negative even if the
/// caller's view of them is stale.
pub(crate) async fn debit_pools(
    conn: &mut PgConnection,
    region_id: RegionId,
    costs: &ResourceAmounts,
) -> Result<Option<ResourceAmounts>, DbError> {
    let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
        r"UPDATE regions
          SET pool_food = pool_food - $2,
              pool_equipment = pool_equipment - $3,
              pool_energy = pool_energy - $4,
              pool_materials = pool_materials - $5
          WHERE id = $1
            AND pool_food >= $2 AND pool_equipment >= $3
            AND pool_energy >= $4 AND pool_materials >= $5
          RETURNING pool_food, pool_equipment, pool_energy, pool_materials",
    )
    .bind(region_id.into_inner())
    .bind(costs.food)
    .bind(costs.equipment)
    .bind(costs.energy)
    .bind(costs.materials)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|(food, equipment, energy, materials)| ResourceAmounts {
        food,
        equipment,
        energy,
        materials,
    }))
}

