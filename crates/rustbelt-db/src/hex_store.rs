//! Hex cell reads and the rust spread pass.

use std::collections::BTreeMap;

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use rustbelt_types::{HexCell, HexDelta, HexId, RegionId};

use crate::error::DbError;
use crate::rows::{HexRow, decode_all};

const HEX_COLUMNS: &str = "id, region_id, q, r, rust_level, center_rank";

/// Operations on the `hex_cells` table.
pub struct HexStore<'a> {
    pool: &'a PgPool,
}

impl<'a> HexStore<'a> {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Every cell, unlocked.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn load_cells(&self) -> Result<Vec<HexCell>, DbError> {
        let rows = sqlx::query_as::<_, HexRow>(&format!("SELECT {HEX_COLUMNS} FROM hex_cells ORDER BY id"))
            .fetch_all(self.pool)
            .await?;
        Ok(decode_all(rows))
    }

    /// Current rust level of every cell.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn rust_levels(&self) -> Result<BTreeMap<HexId, f64>, DbError> {
        let rows: Vec<(Uuid, f64)> = sqlx::query_as("SELECT id, rust_level FROM hex_cells")
            .fetch_all(self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id, rust)| (HexId::from(id), rust)).collect())
    }

    /// Number of cells in each region.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn counts_by_region(&self) -> Result<BTreeMap<RegionId, u32>, DbError> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as("SELECT region_id, COUNT(*) FROM hex_cells GROUP BY region_id")
            .fetch_all(self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, n)| (RegionId::from(id), u32::try_from(n).unwrap_or(u32::MAX)))
            .collect())
    }

    /// Run one spread pass.
    ///
    /// Cells are read with `FOR UPDATE SKIP LOCKED`; cells locked by
    /// someone else sit this pass out. `compute` maps the locked snapshot
    /// to the changed cells, which are written in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails; nothing is
    /// written in that case.
    pub async fn spread_pass<F>(&self, compute: F) -> Result<Vec<HexDelta>, DbError>
    where
        F: FnOnce(&[HexCell]) -> Vec<HexDelta> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, HexRow>(&format!(
            "SELECT {HEX_COLUMNS} FROM hex_cells ORDER BY id FOR UPDATE SKIP LOCKED"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let cells: Vec<HexCell> = decode_all(rows);

        let changes = compute(&cells);
        write_levels(&mut tx, &changes).await?;
        tx.commit().await?;

        tracing::debug!(locked = cells.len(), changed = changes.len(), "rust spread pass written");
        Ok(changes)
    }
}

/// Write new rust levels in one statement.
pub(crate) async fn write_levels(conn: &mut PgConnection, changes: &[HexDelta]) -> Result<(), DbError> {
    if changes.is_empty() {
        return Ok(());
    }
    let ids: Vec<Uuid> = changes.iter().map(|c| c.hex_id.into_inner()).collect();
    let levels: Vec<f64> = changes.iter().map(|c| c.rust_level).collect();
    sqlx::query(
        r"UPDATE hex_cells h SET rust_level = u.rust_level
          FROM UNNEST($1::UUID[], $2::DOUBLE PRECISION[]) AS u(id, rust_level)
          WHERE h.id = u.id",
    )
    .bind(&ids)
    .bind(&levels)
    .execute(conn)
    .await?;
    Ok(())
}
