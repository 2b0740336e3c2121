//! Core entity structs for the Rustbelt simulation.
//!
//! These mirror the persisted tables (regions, hex cells, features, tasks,
//! votes, crews, transfers) plus the small value types shared between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{CrewStatus, FeatureKind, FeatureStatus, RoadClass, ResourceCategory, TaskStatus, TransferStatus};
use crate::ids::{CrewId, FeatureId, HexId, RegionId, TaskId, TransferId, VoterId};

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GeoPoint {
    /// Longitude in degrees.
    pub lon: f64,
    /// Latitude in degrees.
    pub lat: f64,
}

impl GeoPoint {
    /// Create a point from longitude and latitude.
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Squared planar distance in degree units.
    ///
    /// Only meaningful for ranking nearby points against each other.
    pub fn squared_distance(self, other: Self) -> f64 {
        let dx = self.lon - other.lon;
        let dy = self.lat - other.lat;
        dx.mul_add(dx, dy * dy)
    }
}

/// An amount for each of the four resource categories.
///
/// Used both for region pool balances and for task costs. Pool balances are
/// never allowed to go negative: debits go through [`ResourceAmounts::checked_debit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ResourceAmounts {
    /// Food units.
    pub food: i64,
    /// Equipment units.
    pub equipment: i64,
    /// Energy units.
    pub energy: i64,
    /// Materials units.
    pub materials: i64,
}

impl ResourceAmounts {
    /// All categories zero.
    pub const ZERO: Self = Self {
        food: 0,
        equipment: 0,
        energy: 0,
        materials: 0,
    };

    /// Same amount in every category.
    pub const fn uniform(amount: i64) -> Self {
        Self {
            food: amount,
            equipment: amount,
            energy: amount,
            materials: amount,
        }
    }

    /// Amount for one category.
    pub const fn get(&self, category: ResourceCategory) -> i64 {
        match category {
            ResourceCategory::Food => self.food,
            ResourceCategory::Equipment => self.equipment,
            ResourceCategory::Energy => self.energy,
            ResourceCategory::Materials => self.materials,
        }
    }

    /// Mutable access to one category.
    pub const fn get_mut(&mut self, category: ResourceCategory) -> &mut i64 {
        match category {
            ResourceCategory::Food => &mut self.food,
            ResourceCategory::Equipment => &mut self.equipment,
            ResourceCategory::Energy => &mut self.energy,
            ResourceCategory::Materials => &mut self.materials,
        }
    }

    /// Iterate `(category, amount)` pairs in category order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceCategory, i64)> + '_ {
        ResourceCategory::ALL.into_iter().map(|c| (c, self.get(c)))
    }

    /// Whether every category of `self` is at least the matching `cost`.
    pub fn covers(&self, cost: &Self) -> bool {
        ResourceCategory::ALL
            .into_iter()
            .all(|c| self.get(c) >= cost.get(c))
    }

    /// Subtract `cost`, or return `None` if any category would go negative.
    pub fn checked_debit(&self, cost: &Self) -> Option<Self> {
        if !self.covers(cost) {
            return None;
        }
        let mut out = *self;
        for c in ResourceCategory::ALL {
            *out.get_mut(c) = self.get(c).checked_sub(cost.get(c))?;
        }
        Some(out)
    }

    /// Add `credit` to every category, saturating at `i64::MAX`.
    pub fn saturating_credit(&self, credit: &Self) -> Self {
        let mut out = *self;
        for c in ResourceCategory::ALL {
            *out.get_mut(c) = self.get(c).saturating_add(credit.get(c));
        }
        out
    }

    /// Whether every category is zero.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Phase-dependent multipliers applied by every simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PhaseMultipliers {
    /// Scales rust spread between hex cells.
    pub rust_spread: f64,
    /// Scales road health decay.
    pub decay: f64,
    /// Scales building output.
    pub generation: f64,
    /// Scales how fast crews finish repairs.
    pub repair_speed: f64,
}

impl PhaseMultipliers {
    /// All multipliers equal to one.
    pub const NEUTRAL: Self = Self {
        rust_spread: 1.0,
        decay: 1.0,
        generation: 1.0,
        repair_speed: 1.0,
    };

    /// Every multiplier scaled by the same factor (demo mode).
    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            rust_spread: self.rust_spread * factor,
            decay: self.decay * factor,
            generation: self.generation * factor,
            repair_speed: self.repair_speed * factor,
        }
    }
}

// ---------------------------------------------------------------------------
// World entities
// ---------------------------------------------------------------------------

/// A fixed geographic division with its own hub and resource pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Region {
    /// Region identifier.
    pub id: RegionId,
    /// Display name.
    pub name: String,
    /// Hub location where transfers arrive and crews are based.
    pub hub: GeoPoint,
    /// Current pool balances. Never negative.
    pub pools: ResourceAmounts,
    /// Desired number of crews, derived from hex count.
    pub target_crews: u32,
    /// Scales road decay for this region.
    pub difficulty_multiplier: f64,
}

/// A cell of the hex tiling that carries the rust field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct HexCell {
    /// Cell identifier.
    pub id: HexId,
    /// Region the cell belongs to.
    pub region_id: RegionId,
    /// Axial column coordinate.
    pub q: i32,
    /// Axial row coordinate.
    pub r: i32,
    /// Rust level in `[0, 1]`.
    pub rust_level: f64,
    /// Rings away from the region center; rank 0 cells never receive spread.
    pub center_rank: u32,
}

/// Static infrastructure: a road segment or a building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Feature {
    /// Feature identifier.
    pub id: FeatureId,
    /// Owning region.
    pub region_id: RegionId,
    /// Road or building.
    pub kind: FeatureKind,
    /// Road class; `None` for buildings.
    pub road_class: Option<RoadClass>,
    /// Representative point (road midpoint or building centroid).
    pub position: GeoPoint,
    /// Hex cells this feature touches. A road's endpoints terminate in the
    /// first and last entries.
    pub hexes: Vec<HexId>,
    /// Whether a building produces resources.
    pub generates_resources: bool,
}

/// The mutable state of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct FeatureState {
    /// Health in `[0, 100]`.
    pub health: f64,
    /// Maintenance status.
    pub status: FeatureStatus,
}

impl FeatureState {
    /// A fully healthy feature.
    pub const PRISTINE: Self = Self {
        health: 100.0,
        status: FeatureStatus::Normal,
    };
}

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

/// A unit of repair work targeting one road.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// Road being repaired.
    pub feature_id: FeatureId,
    /// Region whose pools pay for the work.
    pub region_id: RegionId,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Resources debited when a crew is dispatched.
    pub costs: ResourceAmounts,
    /// Base on-site work time in seconds, before phase scaling.
    pub duration_secs: i64,
    /// Health restored on completion.
    pub repair_amount: f64,
    /// Baseline plus vote score; higher is more urgent.
    pub priority_score: f64,
    /// Time-decayed sum of votes.
    pub vote_score: f64,
    /// When the task was queued.
    pub created_at: DateTime<Utc>,
    /// When the task reached `done`.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A player's vote on a task. One per (task, voter).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Vote {
    /// Task voted on.
    pub task_id: TaskId,
    /// Voting player.
    pub voter_id: VoterId,
    /// Signed weight; negative values are downvotes.
    pub weight: f64,
    /// When the vote was (last) cast.
    pub created_at: DateTime<Utc>,
}

/// State machine for a crew, carrying exactly the data each state needs.
///
/// Encoding the state this way makes "active task is set iff traveling or
/// working" impossible to violate in memory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CrewState {
    /// At the hub waiting for work.
    Idle,
    /// Driving to a task site.
    Traveling {
        /// The claimed task.
        task_id: TaskId,
        /// Arrival time at the site.
        busy_until: DateTime<Utc>,
        /// Site position.
        destination: GeoPoint,
    },
    /// Repairing on site.
    Working {
        /// The task being worked.
        task_id: TaskId,
        /// When the repair finishes.
        busy_until: DateTime<Utc>,
    },
    /// Driving back to the hub.
    Returning {
        /// Arrival time at the hub.
        busy_until: DateTime<Utc>,
    },
}

impl CrewState {
    /// The coarse status stored in the database.
    pub const fn status(&self) -> CrewStatus {
        match self {
            Self::Idle => CrewStatus::Idle,
            Self::Traveling { .. } => CrewStatus::Traveling,
            Self::Working { .. } => CrewStatus::Working,
            Self::Returning { .. } => CrewStatus::Returning,
        }
    }

    /// The claimed task, set only while traveling or working.
    pub const fn active_task(&self) -> Option<TaskId> {
        match self {
            Self::Traveling { task_id, .. } | Self::Working { task_id, .. } => Some(*task_id),
            Self::Idle | Self::Returning { .. } => None,
        }
    }

    /// When the current leg ends, if the crew is busy.
    pub const fn busy_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Idle => None,
            Self::Traveling { busy_until, .. }
            | Self::Working { busy_until, .. }
            | Self::Returning { busy_until } => Some(*busy_until),
        }
    }

    /// Rebuild a state from its stored columns.
    ///
    /// Returns `None` when the columns violate the state invariant (a task
    /// on an idle crew, a traveling crew without a deadline, and so on).
    pub const fn from_columns(
        status: CrewStatus,
        task_id: Option<TaskId>,
        busy_until: Option<DateTime<Utc>>,
        destination: Option<GeoPoint>,
    ) -> Option<Self> {
        match (status, task_id, busy_until) {
            (CrewStatus::Idle, None, _) => Some(Self::Idle),
            (CrewStatus::Traveling, Some(task_id), Some(busy_until)) => {
                let destination = match destination {
                    Some(point) => point,
                    None => GeoPoint::new(0.0, 0.0),
                };
                Some(Self::Traveling {
                    task_id,
                    busy_until,
                    destination,
                })
            }
            (CrewStatus::Working, Some(task_id), Some(busy_until)) => Some(Self::Working {
                task_id,
                busy_until,
            }),
            (CrewStatus::Returning, None, Some(busy_until)) => Some(Self::Returning { busy_until }),
            _ => None,
        }
    }
}

/// A mobile work unit based at a region hub.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Crew {
    /// Crew identifier.
    pub id: CrewId,
    /// Home region.
    pub region_id: RegionId,
    /// Current state.
    pub state: CrewState,
    /// Last known position.
    pub position: GeoPoint,
}

// ---------------------------------------------------------------------------
// Resource flow
// ---------------------------------------------------------------------------

/// A point on a transfer route with its scheduled arrival time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Waypoint {
    /// Connector position.
    pub position: GeoPoint,
    /// When the shipment passes this point.
    pub arrives_at: DateTime<Utc>,
}

/// A delayed credit from a building to its region's hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ResourceTransfer {
    /// Transfer identifier.
    pub id: TransferId,
    /// Region credited on arrival.
    pub region_id: RegionId,
    /// Producing building.
    pub source_feature_id: FeatureId,
    /// Category carried.
    pub category: ResourceCategory,
    /// Positive amount carried.
    pub amount: i64,
    /// Departure time.
    pub departed_at: DateTime<Utc>,
    /// Arrival time at the hub.
    pub arrives_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: TransferStatus,
    /// Route waypoints; empty when the straight-line fallback was used.
    pub waypoints: Vec<Waypoint>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn debit_refuses_overdraw() {
        let pools = ResourceAmounts::uniform(10);
        let cost = ResourceAmounts {
            food: 5,
            equipment: 11,
            energy: 0,
            materials: 0,
        };
        assert!(!pools.covers(&cost));
        assert_eq!(pools.checked_debit(&cost), None);
    }

    #[test]
    fn debit_subtracts_each_category() {
        let pools = ResourceAmounts::uniform(100);
        let after = pools.checked_debit(&ResourceAmounts::uniform(10));
        assert_eq!(after, Some(ResourceAmounts::uniform(90)));
    }

    #[test]
    fn crew_state_columns_enforce_invariant() {
        let until = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single();
        let task = Some(TaskId::new());
        assert!(CrewState::from_columns(CrewStatus::Idle, task, None, None).is_none());
        assert!(CrewState::from_columns(CrewStatus::Traveling, None, until, None).is_none());
        assert!(CrewState::from_columns(CrewStatus::Returning, task, until, None).is_none());

        let working = CrewState::from_columns(CrewStatus::Working, task, until, None);
        assert_eq!(working.and_then(|s| s.active_task()), task);
        assert_eq!(working.map(|s| s.status()), Some(CrewStatus::Working));
    }

    #[test]
    fn scaled_multipliers_scale_uniformly() {
        let m = PhaseMultipliers::NEUTRAL.scaled(3.0);
        assert!((m.rust_spread - 3.0).abs() < f64::EPSILON);
        assert!((m.repair_speed - 3.0).abs() < f64::EPSILON);
    }
}
