//! Crew dispatch and state advancement.
//!
//! A pass runs in one transaction and moves each crew inside its own
//! savepoint. A crew whose savepoint fails is rolled back and logged; the
//! others in the same pass still commit.
//!
//! # Claiming a task
//!
//! ```text
//! lock region (FOR UPDATE)
//!   -> queued tasks in region (FOR UPDATE OF t SKIP LOCKED)
//!   -> select best affordable candidate
//!   -> debit pools (guarded: every pool >= cost)
//!   -> task queued -> active
//! ```
//!
//! Locking the region first serializes claims against its pools, so two
//! crews of one region never both spend the same units.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Connection, PgConnection, PgPool};
use uuid::Uuid;

use rustbelt_types::{
    Crew, CrewId, CrewState, CrewStatus, FeatureId, FeatureState, FeatureStatus, GeoPoint, HexDelta, HexId,
    PhaseMultipliers, RegionId, ResourceAmounts, RoadClass, TaskId,
};
use rustbelt_world::{
    CrewParams, DecayParams, RoadClassTable, RoadGraph, TaskCandidate, TravelParams, crew, estimate_travel,
    select_task,
};

use crate::error::DbError;
use crate::feature_store::{lock_state, write_states};
use crate::region_store::{debit_pools, lock_region};
use crate::rows::{CrewColumns, CrewRow, decode_all};

pub(crate) const CREW_COLUMNS: &str = "id, region_id, status, active_task_id, busy_until, lon, lat, dest_lon, dest_lat";

/// Tick inputs the crew transitions need.
#[derive(Debug, Clone, Copy)]
pub struct CrewPlan<'a> {
    /// Tick wall time.
    pub now: DateTime<Utc>,
    /// Active phase multipliers.
    pub multipliers: PhaseMultipliers,
    /// Per-class weights for candidate ordering.
    pub road_classes: &'a RoadClassTable,
    /// Travel estimation.
    pub travel: &'a TravelParams,
    /// Status thresholds for healed roads.
    pub decay: &'a DecayParams,
    /// Completion pushback.
    pub crews: &'a CrewParams,
    /// Routing graphs by region.
    pub graphs: &'a BTreeMap<RegionId, RoadGraph>,
}

impl CrewPlan<'_> {
    /// Whole-second trip time within a region.
    pub fn travel_secs(&self, region_id: RegionId, from: GeoPoint, to: GeoPoint) -> i64 {
        estimate_travel(self.graphs.get(&region_id), from, to, self.now, self.travel).travel_secs
    }
}

/// A task a crew has claimed and paid for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Claim {
    /// The task, now active.
    pub task_id: TaskId,
    /// Its road.
    pub feature_id: FeatureId,
    /// Its priority when claimed.
    pub priority_score: f64,
    /// Where the crew is headed.
    pub site: GeoPoint,
    /// Paying region.
    pub region_id: RegionId,
    /// Pools after the debit.
    pub pools: ResourceAmounts,
}

/// An idle crew that was sent out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dispatched {
    /// The crew after the transition.
    pub crew: Crew,
    /// What it claimed.
    pub claim: Claim,
    /// Trip time to the site.
    pub travel_secs: i64,
}

/// One crew transition made by [`CrewStore::advance_due`].
#[derive(Debug, Clone, PartialEq)]
pub enum Advanced {
    /// traveling -> working.
    Arrived {
        /// The crew after the transition.
        crew: Crew,
        /// Task being worked.
        task_id: TaskId,
        /// Road now under repair.
        feature_id: FeatureId,
        /// Road state after the transition.
        state: FeatureState,
        /// On-site time.
        work_secs: i64,
    },
    /// working -> traveling (chained) or returning.
    Completed {
        /// The crew after the transition.
        crew: Crew,
        /// Finished task.
        task_id: TaskId,
        /// Repaired road.
        feature_id: FeatureId,
        /// Final priority of the finished task.
        priority_score: f64,
        /// Road state after the repair.
        healed: FeatureState,
        /// Cells pushed back.
        hexes: Vec<HexDelta>,
        /// Next task and trip time when the crew chained.
        next: Option<Box<(Claim, i64)>>,
    },
    /// returning -> idle.
    Returned {
        /// The crew after the transition.
        crew: Crew,
    },
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: Uuid,
    feature_id: Uuid,
    cost_food: i64,
    cost_equipment: i64,
    cost_energy: i64,
    cost_materials: i64,
    priority_score: f64,
    lon: f64,
    lat: f64,
    road_class: Option<String>,
    health: f64,
}

/// Operations on the `crews` table.
pub struct CrewStore<'a> {
    pool: &'a PgPool,
}

impl<'a> CrewStore<'a> {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Every crew.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn load_all(&self) -> Result<Vec<Crew>, DbError> {
        let rows = sqlx::query_as::<_, CrewRow>(&format!("SELECT {CREW_COLUMNS} FROM crews ORDER BY id"))
            .fetch_all(self.pool)
            .await?;
        Ok(decode_all(rows))
    }

    /// Send every idle crew to the best affordable queued task in its
    /// region.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the idle crews cannot be listed.
    /// Per-crew failures are logged and skipped.
    pub async fn dispatch_idle(&self, plan: &CrewPlan<'_>) -> Result<Vec<Dispatched>, DbError> {
        let mut tx = self.pool.begin().await?;
        let idle: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM crews WHERE status = 'idle' ORDER BY id")
            .fetch_all(&mut *tx)
            .await?;

        let mut dispatched = Vec::new();
        for id in idle {
            let crew_id = CrewId::from(id);
            let mut savepoint = tx.begin().await?;
            match dispatch_one(&mut savepoint, crew_id, plan).await {
                Ok(Some(d)) => {
                    savepoint.commit().await?;
                    dispatched.push(d);
                }
                Ok(None) => savepoint.rollback().await?,
                Err(e) => {
                    savepoint.rollback().await?;
                    tracing::warn!(crew_id = %crew_id, error = %e, "crew dispatch rolled back");
                }
            }
        }
        tx.commit().await?;
        Ok(dispatched)
    }

    /// Move every crew whose current leg has ended to its next state.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the due crews cannot be listed.
    /// Per-crew failures are logged and skipped.
    pub async fn advance_due(&self, plan: &CrewPlan<'_>) -> Result<Vec<Advanced>, DbError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, CrewRow>(&format!(
            "SELECT {CREW_COLUMNS} FROM crews WHERE busy_until <= $1 ORDER BY busy_until, id"
        ))
        .bind(plan.now)
        .fetch_all(&mut *tx)
        .await?;
        let due: Vec<Crew> = decode_all(rows);

        let mut advanced = Vec::new();
        for crew in due {
            let mut savepoint = tx.begin().await?;
            let result = match crew.state {
                CrewState::Traveling { .. } => arrive(&mut savepoint, crew.id, plan).await,
                CrewState::Working { .. } => complete(&mut savepoint, crew.id, plan).await,
                CrewState::Returning { .. } => return_home(&mut savepoint, crew.id).await,
                CrewState::Idle => Ok(None),
            };
            match result {
                Ok(Some(a)) => {
                    savepoint.commit().await?;
                    advanced.push(a);
                }
                Ok(None) => savepoint.rollback().await?,
                Err(e) => {
                    savepoint.rollback().await?;
                    tracing::warn!(crew_id = %crew.id, error = %e, "crew transition rolled back");
                }
            }
        }
        tx.commit().await?;
        Ok(advanced)
    }
}

async fn dispatch_one(
    conn: &mut PgConnection,
    crew_id: CrewId,
    plan: &CrewPlan<'_>,
) -> Result<Option<Dispatched>, DbError> {
    let Some(crew) = lock_crew(conn, crew_id, CrewStatus::Idle).await? else {
        return Ok(None);
    };
    let Some(claim) = claim_task(conn, crew.region_id, crew.position, plan).await? else {
        return Ok(None);
    };

    let travel_secs = plan.travel_secs(crew.region_id, crew.position, claim.site);
    let crew = Crew {
        state: CrewState::Traveling {
            task_id: claim.task_id,
            busy_until: plan.now + Duration::seconds(travel_secs),
            destination: claim.site,
        },
        ..crew
    };
    write_crew(conn, &crew).await?;

    tracing::debug!(crew_id = %crew.id, task_id = %claim.task_id, travel_secs, "crew dispatched");
    Ok(Some(Dispatched {
        crew,
        claim,
        travel_secs,
    }))
}

async fn arrive(
    conn: &mut PgConnection,
    crew_id: CrewId,
    plan: &CrewPlan<'_>,
) -> Result<Option<Advanced>, DbError> {
    let Some(crew) = lock_crew(conn, crew_id, CrewStatus::Traveling).await? else {
        return Ok(None);
    };
    let CrewState::Traveling {
        task_id,
        busy_until,
        destination,
    } = crew.state
    else {
        return Ok(None);
    };
    if busy_until > plan.now {
        return Ok(None);
    }

    let task: Option<(Uuid, i64)> =
        sqlx::query_as("SELECT feature_id, duration_secs FROM tasks WHERE id = $1 AND status = 'active' FOR UPDATE")
            .bind(task_id.into_inner())
            .fetch_optional(&mut *conn)
            .await?;
    let Some((feature_id, duration_secs)) = task else {
        return Ok(None);
    };
    let feature_id = FeatureId::from(feature_id);
    let Some(before) = lock_state(conn, feature_id).await? else {
        return Ok(None);
    };
    let state = FeatureState {
        status: FeatureStatus::Repairing,
        ..before
    };
    write_states(conn, &[(feature_id, state)]).await?;

    let work_secs = crew::repair_duration_secs(duration_secs, &plan.multipliers);
    let crew = Crew {
        state: CrewState::Working {
            task_id,
            busy_until: plan.now + Duration::seconds(work_secs),
        },
        position: destination,
        ..crew
    };
    write_crew(conn, &crew).await?;

    Ok(Some(Advanced::Arrived {
        crew,
        task_id,
        feature_id,
        state,
        work_secs,
    }))
}

async fn complete(
    conn: &mut PgConnection,
    crew_id: CrewId,
    plan: &CrewPlan<'_>,
) -> Result<Option<Advanced>, DbError> {
    let Some(crew) = lock_crew(conn, crew_id, CrewStatus::Working).await? else {
        return Ok(None);
    };
    let CrewState::Working { task_id, busy_until } = crew.state else {
        return Ok(None);
    };
    if busy_until > plan.now {
        return Ok(None);
    }

    let finished: Option<(Uuid, f64, f64, f64, f64)> = sqlx::query_as(
        r"WITH done AS (
              UPDATE tasks SET status = 'done', completed_at = $2
              WHERE id = $1 AND status = 'active'
              RETURNING feature_id, repair_amount, priority_score
          )
          SELECT done.feature_id, done.repair_amount, done.priority_score, f.lon, f.lat
          FROM done JOIN features f ON f.id = done.feature_id",
    )
    .bind(task_id.into_inner())
    .bind(plan.now)
    .fetch_optional(&mut *conn)
    .await?;
    let Some((feature_id, repair_amount, priority_score, lon, lat)) = finished else {
        return Ok(None);
    };
    let feature_id = FeatureId::from(feature_id);
    let site = GeoPoint::new(lon, lat);

    let Some(before) = lock_state(conn, feature_id).await? else {
        return Ok(None);
    };
    let healed = crew::healed_state(before, repair_amount, plan.decay);
    write_states(conn, &[(feature_id, healed)]).await?;

    let pushback = crew::completion_pushback(&plan.multipliers, plan.crews);
    let hexes = push_back_rust(conn, feature_id, pushback).await?;

    let next = claim_task(conn, crew.region_id, site, plan)
        .await?
        .map(|claim| (claim, plan.travel_secs(crew.region_id, site, claim.site)));
    let state = match next {
        Some((claim, travel_secs)) => CrewState::Traveling {
            task_id: claim.task_id,
            busy_until: plan.now + Duration::seconds(travel_secs),
            destination: claim.site,
        },
        None => {
            let hub = hub_of(conn, crew.region_id).await?.unwrap_or(site);
            CrewState::Returning {
                busy_until: plan.now + Duration::seconds(plan.travel_secs(crew.region_id, site, hub)),
            }
        }
    };
    let crew = Crew {
        state,
        position: site,
        ..crew
    };
    write_crew(conn, &crew).await?;

    Ok(Some(Advanced::Completed {
        crew,
        task_id,
        feature_id,
        priority_score,
        healed,
        hexes,
        next: next.map(Box::new),
    }))
}

async fn return_home(conn: &mut PgConnection, crew_id: CrewId) -> Result<Option<Advanced>, DbError> {
    let Some(crew) = lock_crew(conn, crew_id, CrewStatus::Returning).await? else {
        return Ok(None);
    };
    let hub = hub_of(conn, crew.region_id).await?.unwrap_or(crew.position);
    let crew = Crew {
        state: CrewState::Idle,
        position: hub,
        ..crew
    };
    write_crew(conn, &crew).await?;
    Ok(Some(Advanced::Returned { crew }))
}

/// Lock one crew in `status`, skipping it if another session holds it.
async fn lock_crew(conn: &mut PgConnection, crew_id: CrewId, status: CrewStatus) -> Result<Option<Crew>, DbError> {
    let row = sqlx::query_as::<_, CrewRow>(&format!(
        "SELECT {CREW_COLUMNS} FROM crews WHERE id = $1 AND status = $2 FOR UPDATE SKIP LOCKED"
    ))
    .bind(crew_id.into_inner())
    .bind(status.as_str())
    .fetch_optional(conn)
    .await?;
    row.map(Crew::try_from).transpose()
}

/// Claim the best affordable queued task in a region for a crew at `from`.
async fn claim_task(
    conn: &mut PgConnection,
    region_id: RegionId,
    from: GeoPoint,
    plan: &CrewPlan<'_>,
) -> Result<Option<Claim>, DbError> {
    let Some(region) = lock_region(conn, region_id).await? else {
        return Ok(None);
    };

    let rows = sqlx::query_as::<_, CandidateRow>(
        r"SELECT t.id, t.feature_id, t.cost_food, t.cost_equipment, t.cost_energy, t.cost_materials,
                 t.priority_score, f.lon, f.lat, f.road_class, fs.health
          FROM tasks t
          JOIN features f ON f.id = t.feature_id
          JOIN feature_state fs ON fs.feature_id = t.feature_id
          WHERE t.region_id = $1 AND t.status = 'queued'
          FOR UPDATE OF t SKIP LOCKED",
    )
    .bind(region_id.into_inner())
    .fetch_all(&mut *conn)
    .await?;

    let priorities: BTreeMap<TaskId, f64> = rows.iter().map(|r| (TaskId::from(r.id), r.priority_score)).collect();
    let candidates: Vec<TaskCandidate> = rows
        .into_iter()
        .map(|r| {
            let class = r.road_class.as_deref().and_then(|c| c.parse::<RoadClass>().ok());
            TaskCandidate {
                task_id: r.id.into(),
                feature_id: r.feature_id.into(),
                position: GeoPoint::new(r.lon, r.lat),
                costs: ResourceAmounts {
                    food: r.cost_food,
                    equipment: r.cost_equipment,
                    energy: r.cost_energy,
                    materials: r.cost_materials,
                },
                class_weight: plan.road_classes.get_or_default(class).priority_weight,
                health: r.health,
            }
        })
        .collect();

    let Some(chosen) = select_task(&candidates, from, &region.pools()).copied() else {
        return Ok(None);
    };
    let Some(pools) = debit_pools(conn, region_id, &chosen.costs).await? else {
        tracing::debug!(region_id = %region_id, task_id = %chosen.task_id, "pools short at debit");
        return Ok(None);
    };
    sqlx::query("UPDATE tasks SET status = 'active' WHERE id = $1 AND status = 'queued'")
        .bind(chosen.task_id.into_inner())
        .execute(&mut *conn)
        .await?;

    Ok(Some(Claim {
        task_id: chosen.task_id,
        feature_id: chosen.feature_id,
        priority_score: priorities.get(&chosen.task_id).copied().unwrap_or_default(),
        site: chosen.position,
        region_id,
        pools,
    }))
}

/// Lower the rust of every cell a road touches.
async fn push_back_rust(conn: &mut PgConnection, feature_id: FeatureId, amount: f64) -> Result<Vec<HexDelta>, DbError> {
    if amount <= 0.0 {
        return Ok(Vec::new());
    }
    let rows: Vec<(Uuid, f64)> = sqlx::query_as(
        r"UPDATE hex_cells h SET rust_level = GREATEST(0, h.rust_level - $2)
          FROM feature_hexes fh
          WHERE fh.feature_id = $1 AND fh.hex_id = h.id
          RETURNING h.id, h.rust_level",
    )
    .bind(feature_id.into_inner())
    .bind(amount)
    .fetch_all(conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, rust_level)| HexDelta {
            hex_id: HexId::from(id),
            rust_level,
        })
        .collect())
}

pub(crate) async fn hub_of(conn: &mut PgConnection, region_id: RegionId) -> Result<Option<GeoPoint>, DbError> {
    let hub: Option<(f64, f64)> = sqlx::query_as("SELECT hub_lon, hub_lat FROM regions WHERE id = $1")
        .bind(region_id.into_inner())
        .fetch_optional(conn)
        .await?;
    Ok(hub.map(|(lon, lat)| GeoPoint::new(lon, lat)))
}

/// Write a crew's state and position.
pub(crate) async fn write_crew(conn: &mut PgConnection, crew: &Crew) -> Result<(), DbError> {
    let columns = CrewColumns::from(&crew.state);
    sqlx::query(
        r"UPDATE crews
          SET status = $2, active_task_id = $3, busy_until = $4, lon = $5, lat = $6, dest_lon = $7, dest_lat = $8
          WHERE id = $1",
    )
    .bind(crew.id.into_inner())
    .bind(columns.status)
    .bind(columns.active_task_id)
    .bind(columns.busy_until)
    .bind(crew.position.lon)
    .bind(crew.position.lat)
    .bind(columns.dest_lon)
    .bind(columns.dest_lat)
    .execute(conn)
    .await?;
    Ok(())
}
