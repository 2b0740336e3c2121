//! Resource transfers: enqueueing building output and settling arrivals.
//!
//! `resource_transfers` is a soft dependency. A deployment that has not
//! provisioned it still ticks; [`TransferStore::table_exists`] lets the
//! caller probe before using the pipeline, and a query that races a
//! dropped table surfaces as [`DbError::is_undefined_table`].

use sqlx::PgPool;
use uuid::Uuid;

use rustbelt_types::{RegionId, ResourceAmounts, ResourceTransfer};

use crate::error::DbError;

/// Pools of a region after due transfers were credited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Credited region.
    pub region_id: RegionId,
    /// Region name, for the feed.
    pub region_name: String,
    /// Pools after the credit.
    pub pools: ResourceAmounts,
    /// Amounts credited this pass.
    pub credited: ResourceAmounts,
}

#[derive(sqlx::FromRow)]
struct SettlementRow {
    id: Uuid,
    name: String,
    pool_food: i64,
    pool_equipment: i64,
    pool_energy: i64,
    pool_materials: i64,
    food: i64,
    equipment: i64,
    energy: i64,
    materials: i64,
}

impl From<SettlementRow> for Settlement {
    fn from(row: SettlementRow) -> Self {
        Self {
            region_id: row.id.into(),
            region_name: row.name,
            pools: ResourceAmounts {
                food: row.pool_food,
                equipment: row.pool_equipment,
                energy: row.pool_energy,
                materials: row.pool_materials,
            },
            credited: ResourceAmounts {
                food: row.food,
                equipment: row.equipment,
                energy: row.energy,
                materials: row.materials,
            },
        }
    }
}

/// Operations on the `resource_transfers` table.
pub struct TransferStore<'a> {
    pool: &'a PgPool,
}

impl<'a> TransferStore<'a> {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Whether `resource_transfers` exists in the current schema.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the catalog query fails.
    pub async fn table_exists(&self) -> Result<bool, DbError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass('resource_transfers') IS NOT NULL")
            .fetch_one(self.pool)
            .await?;
        Ok(exists)
    }

    /// Insert transfers in one statement.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if a waypoint list does not
    /// serialize, or [`DbError::Postgres`] if the insert fails.
    pub async fn insert_batch(&self, transfers: &[ResourceTransfer]) -> Result<u64, DbError> {
        if transfers.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(transfers.len());
        let mut regions = Vec::with_capacity(transfers.len());
        let mut sources = Vec::with_capacity(transfers.len());
        let mut categories = Vec::with_capacity(transfers.len());
        let mut amounts = Vec::with_capacity(transfers.len());
        let mut departed = Vec::with_capacity(transfers.len());
        let mut arrives = Vec::with_capacity(transfers.len());
        let mut statuses = Vec::with_capacity(transfers.len());
        let mut waypoints = Vec::with_capacity(transfers.len());
        for t in transfers {
            ids.push(t.id.into_inner());
            regions.push(t.region_id.into_inner());
            sources.push(t.source_feature_id.into_inner());
            categories.push(t.category.as_str());
            amounts.push(t.amount);
            departed.push(t.departed_at);
            arrives.push(t.arrives_at);
            statuses.push(t.status.as_str());
            waypoints.push(serde_json::to_value(&t.waypoints)?);
        }

        let result = sqlx::query(
            r"INSERT INTO resource_transfers
                  (id, region_id, source_feature_id, category, amount, departed_at, arrives_at, status, waypoints)
              SELECT * FROM UNNEST(
                  $1::UUID[], $2::UUID[], $3::UUID[], $4::TEXT[], $5::BIGINT[],
                  $6::TIMESTAMPTZ[], $7::TIMESTAMPTZ[], $8::TEXT[], $9::JSONB[])",
        )
        .bind(&ids)
        .bind(&regions)
        .bind(&sources)
        .bind(&categories)
        .bind(&amounts)
        .bind(&departed)
        .bind(&arrives)
        .bind(&statuses)
        .bind(&waypoints)
        .execute(self.pool)
        .await?;

        tracing::debug!(count = result.rows_affected(), "resource transfers enqueued");
        Ok(result.rows_affected())
    }

    /// Mark every due transfer arrived and credit its region, in one
    /// statement.
    ///
    /// Due rows are claimed with `FOR UPDATE SKIP LOCKED` and flipped to
    /// `arrived` by the same statement that credits the pools, so a
    /// transfer is credited at most once even with concurrent settlers.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the statement fails.
    pub async fn settle_due(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<Settlement>, DbError> {
        let rows = sqlx::query_as::<_, SettlementRow>(
            r"WITH due AS (
                  SELECT id FROM resource_transfers
                  WHERE status = 'in_transit' AND arrives_at <= $1
                  ORDER BY id
                  FOR UPDATE SKIP LOCKED
              ), arrived AS (
                  UPDATE resource_transfers t SET status = 'arrived'
                  FROM due WHERE t.id = due.id
                  RETURNING t.region_id, t.category, t.amount
              ), sums AS (
                  SELECT region_id,
                         COALESCE(SUM(amount) FILTER (WHERE category = 'food'), 0)::BIGINT AS food,
                         COALESCE(SUM(amount) FILTER (WHERE category = 'equipment'), 0)::BIGINT AS equipment,
                         COALESCE(SUM(amount) FILTER (WHERE category = 'energy'), 0)::BIGINT AS energy,
                         COALESCE(SUM(amount) FILTER (WHERE category = 'materials'), 0)::BIGINT AS materials
                  FROM arrived
                  GROUP BY region_id
              )
              UPDATE regions r
              SET pool_food = r.pool_food + s.food,
                  pool_equipment = r.pool_equipment + s.equipment,
                  pool_energy = r.pool_energy + s.energy,
                  pool_materials = r.pool_materials + s.materials
              FROM sums s
              WHERE r.id = s.region_id
              RETURNING r.id, r.name, r.pool_food, r.pool_equipment, r.pool_energy, r.pool_materials,
                        s.food, s.equipment, s.energy, s.materials",
        )
        .bind(now)
        .fetch_all(self.pool)
        .await?;

        tracing::debug!(regions = rows.len(), "due transfers settled");
        Ok(rows.into_iter().map(Settlement::from).collect())
    }
}
