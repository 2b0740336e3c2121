//! Row types and their conversion into domain values.
//!
//! Rows are decoded at runtime with [`sqlx::FromRow`]. A row that does not
//! convert (an unknown status string, a crew violating the state invariant)
//! is a [`DbError::Corrupt`]; callers that scan many rows skip such rows
//! with [`decode_all`] instead of failing the whole step.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use rustbelt_types::{
    Crew, CrewState, CrewStatus, Feature, FeatureKind, FeatureState, FeatureStatus, GeoPoint, HexCell, HexId,
    Region, ResourceAmounts, RoadClass, Task, TaskStatus,
};

use crate::error::DbError;

fn parse<T: FromStr>(table: &'static str, column: &str, value: &str) -> Result<T, DbError> {
    value
        .parse()
        .map_err(|_unknown| DbError::corrupt(table, format!("unknown {column} '{value}'")))
}

/// Convert every row, logging and dropping the ones that fail.
pub fn decode_all<R, T>(rows: Vec<R>) -> Vec<T>
where
    T: TryFrom<R, Error = DbError>,
{
    rows.into_iter()
        .filter_map(|row| match T::try_from(row) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable row");
                None
            }
        })
        .collect()
}

/// Database spelling of a feature kind.
pub const fn feature_kind_to_db(kind: FeatureKind) -> &'static str {
    match kind {
        FeatureKind::Road => "road",
        FeatureKind::Building => "building",
    }
}

fn feature_kind_from_db(value: &str) -> Result<FeatureKind, DbError> {
    match value {
        "road" => Ok(FeatureKind::Road),
        "building" => Ok(FeatureKind::Building),
        other => Err(DbError::corrupt("features", format!("unknown kind '{other}'"))),
    }
}

/// A row from `regions`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegionRow {
    /// Region ID.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Hub longitude.
    pub hub_lon: f64,
    /// Hub latitude.
    pub hub_lat: f64,
    /// Food pool.
    pub pool_food: i64,
    /// Equipment pool.
    pub pool_equipment: i64,
    /// Energy pool.
    pub pool_energy: i64,
    /// Materials pool.
    pub pool_materials: i64,
    /// Desired crew count.
    pub target_crews: i32,
    /// Decay scaling.
    pub difficulty_multiplier: f64,
}

impl RegionRow {
    /// The four pool columns.
    pub const fn pools(&self) -> ResourceAmounts {
        ResourceAmounts {
            food: self.pool_food,
            equipment: self.pool_equipment,
            energy: self.pool_energy,
            materials: self.pool_materials,
        }
    }
}

impl TryFrom<RegionRow> for Region {
    type Error = DbError;

    fn try_from(row: RegionRow) -> Result<Self, DbError> {
        let pools = row.pools();
        let target_crews = u32::try_from(row.target_crews)
            .map_err(|_negative| DbError::corrupt("regions", format!("negative target_crews {}", row.target_crews)))?;
        Ok(Self {
            id: row.id.into(),
            name: row.name,
            hub: GeoPoint::new(row.hub_lon, row.hub_lat),
            pools,
            target_crews,
            difficulty_multiplier: row.difficulty_multiplier,
        })
    }
}

/// A row from `hex_cells`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HexRow {
    /// Cell ID.
    pub id: Uuid,
    /// Owning region.
    pub region_id: Uuid,
    /// Axial q.
    pub q: i32,
    /// Axial r.
    pub r: i32,
    /// Rust level.
    pub rust_level: f64,
    /// Rings from the region center.
    pub center_rank: i32,
}

impl TryFrom<HexRow> for HexCell {
    type Error = DbError;

    fn try_from(row: HexRow) -> Result<Self, DbError> {
        let center_rank = u32::try_from(row.center_rank)
            .map_err(|_negative| DbError::corrupt("hex_cells", format!("negative center_rank {}", row.center_rank)))?;
        Ok(Self {
            id: row.id.into(),
            region_id: row.region_id.into(),
            q: row.q,
            r: row.r,
            rust_level: row.rust_level,
            center_rank,
        })
    }
}

/// A row from `features` with its ordered hex list.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeatureRow {
    /// Feature ID.
    pub id: Uuid,
    /// Owning region.
    pub region_id: Uuid,
    /// `road` or `building`.
    pub kind: String,
    /// Road class, roads only.
    pub road_class: Option<String>,
    /// Representative longitude.
    pub lon: f64,
    /// Representative latitude.
    pub lat: f64,
    /// Whether the building produces resources.
    pub generates_resources: bool,
    /// Hex IDs in ordinal order.
    pub hexes: Vec<Uuid>,
}

impl TryFrom<FeatureRow> for Feature {
    type Error = DbError;

    fn try_from(row: FeatureRow) -> Result<Self, DbError> {
        let road_class = row
            .road_class
            .as_deref()
            .map(|c| parse::<RoadClass>("features", "road_class", c))
            .transpose()?;
        Ok(Self {
            id: row.id.into(),
            region_id: row.region_id.into(),
            kind: feature_kind_from_db(&row.kind)?,
            road_class,
            position: GeoPoint::new(row.lon, row.lat),
            hexes: row.hexes.into_iter().map(HexId::from).collect(),
            generates_resources: row.generates_resources,
        })
    }
}

/// A row from `feature_state`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeatureStateRow {
    /// Feature ID.
    pub feature_id: Uuid,
    /// Health `[0, 100]`.
    pub health: f64,
    /// Status text.
    pub status: String,
}

impl FeatureStateRow {
    /// Decode the health and status.
    pub fn state(&self) -> Result<FeatureState, DbError> {
        Ok(FeatureState {
            health: self.health,
            status: parse::<FeatureStatus>("feature_state", "status", &self.status)?,
        })
    }
}

/// A row from `tasks`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    /// Task ID.
    pub id: Uuid,
    /// Target road.
    pub feature_id: Uuid,
    /// Region whose pools pay.
    pub region_id: Uuid,
    /// Status text.
    pub status: String,
    /// Food cost.
    pub cost_food: i64,
    /// Equipment cost.
    pub cost_equipment: i64,
    /// Energy cost.
    pub cost_energy: i64,
    /// Materials cost.
    pub cost_materials: i64,
    /// Base repair duration.
    pub duration_secs: i64,
    /// Health restored.
    pub repair_amount: f64,
    /// Priority score.
    pub priority_score: f64,
    /// Decayed vote sum.
    pub vote_score: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    /// The four cost columns.
    pub const fn costs(&self) -> ResourceAmounts {
        ResourceAmounts {
            food: self.cost_food,
            equipment: self.cost_equipment,
            energy: self.cost_energy,
            materials: self.cost_materials,
        }
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, DbError> {
        Ok(Self {
            id: row.id.into(),
            feature_id: row.feature_id.into(),
            region_id: row.region_id.into(),
            status: parse::<TaskStatus>("tasks", "status", &row.status)?,
            costs: row.costs(),
            duration_secs: row.duration_secs,
            repair_amount: row.repair_amount,
            priority_score: row.priority_score,
            vote_score: row.vote_score,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

/// A row from `crews`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CrewRow {
    /// Crew ID.
    pub id: Uuid,
    /// Home region.
    pub region_id: Uuid,
    /// Status text.
    pub status: String,
    /// Claimed task.
    pub active_task_id: Option<Uuid>,
    /// End of the current leg.
    pub busy_until: Option<DateTime<Utc>>,
    /// Current longitude.
    pub lon: f64,
    /// Current latitude.
    pub lat: f64,
    /// Destination longitude while traveling.
    pub dest_lon: Option<f64>,
    /// Destination latitude while traveling.
    pub dest_lat: Option<f64>,
}

impl TryFrom<CrewRow> for Crew {
    type Error = DbError;

    fn try_from(row: CrewRow) -> Result<Self, DbError> {
        let status = parse::<CrewStatus>("crews", "status", &row.status)?;
        let destination = row.dest_lon.zip(row.dest_lat).map(|(lon, lat)| GeoPoint::new(lon, lat));
        let state = CrewState::from_columns(status, row.active_task_id.map(Into::into), row.busy_until, destination)
            .ok_or_else(|| DbError::corrupt("crews", format!("crew {} has inconsistent state columns", row.id)))?;
        Ok(Self {
            id: row.id.into(),
            region_id: row.region_id.into(),
            state,
            position: GeoPoint::new(row.lon, row.lat),
        })
    }
}

/// Column values that store a [`CrewState`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrewColumns {
    /// Status text.
    pub status: &'static str,
    /// Claimed task.
    pub active_task_id: Option<Uuid>,
    /// End of the current leg.
    pub busy_until: Option<DateTime<Utc>>,
    /// Destination longitude.
    pub dest_lon: Option<f64>,
    /// Destination latitude.
    pub dest_lat: Option<f64>,
}

impl From<&CrewState> for CrewColumns {
    fn from(state: &CrewState) -> Self {
        let destination = match state {
            CrewState::Traveling { destination, .. } => Some(*destination),
            CrewState::Idle | CrewState::Working { .. } | CrewState::Returning { .. } => None,
        };
        Self {
            status: state.status().as_str(),
            active_task_id: state.active_task().map(Into::into),
            busy_until: state.busy_until(),
            dest_lon: destination.map(|p| p.lon),
            dest_lat: destination.map(|p| p.lat),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn crew_row(status: &str, task: Option<Uuid>, busy: Option<DateTime<Utc>>) -> CrewRow {
        CrewRow {
            id: Uuid::now_v7(),
            region_id: Uuid::now_v7(),
            status: status.to_owned(),
            active_task_id: task,
            busy_until: busy,
            lon: 1.0,
            lat: 2.0,
            dest_lon: Some(3.0),
            dest_lat: Some(4.0),
        }
    }

    #[test]
    fn traveling_crew_decodes_with_destination() {
        let task = Uuid::now_v7();
        let crew = Crew::try_from(crew_row("traveling", Some(task), Some(Utc::now()))).unwrap();
        assert_eq!(crew.state.active_task().map(|t| t.into_inner()), Some(task));
        let columns = CrewColumns::from(&crew.state);
        assert_eq!(columns.status, "traveling");
        assert_eq!(columns.dest_lon, Some(3.0));
    }

    #[test]
    fn idle_crew_with_task_is_corrupt() {
        let result = Crew::try_from(crew_row("idle", Some(Uuid::now_v7()), None));
        assert!(matches!(result, Err(DbError::Corrupt { table: "crews", .. })));
    }

    #[test]
    fn unknown_statuses_are_dropped_by_decode_all() {
        let rows = vec![crew_row("idle", None, None), crew_row("sleeping", None, None)];
        let crews: Vec<Crew> = decode_all(rows);
        assert_eq!(crews.len(), 1);
    }

    #[test]
    fn feature_rows_keep_hex_order() {
        let hexes = vec![Uuid::now_v7(), Uuid::now_v7()];
        let row = FeatureRow {
            id: Uuid::now_v7(),
            region_id: Uuid::now_v7(),
            kind: "road".to_owned(),
            road_class: Some("secondary".to_owned()),
            lon: 0.0,
            lat: 0.0,
            generates_resources: false,
            hexes: hexes.clone(),
        };
        let feature = Feature::try_from(row).unwrap();
        assert_eq!(feature.road_class, Some(RoadClass::Secondary));
        assert_eq!(feature.hexes.into_iter().map(HexId::into_inner).collect::<Vec<_>>(), hexes);
    }
}
