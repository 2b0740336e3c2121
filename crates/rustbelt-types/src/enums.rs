//! Enumeration types for the Rustbelt simulation.
//!
//! Every enum here is persisted or published, so each one serializes as a
//! stable `snake_case` string.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Day cycle
// ---------------------------------------------------------------------------

/// One of the four recurring phases of the day cycle.
///
/// Phases run in the fixed order dawn, day, dusk, night and then wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Morning transition; rust slows, crews ramp up.
    Dawn,
    /// Full daylight; lowest rust spread, highest generation.
    Day,
    /// Evening transition.
    Dusk,
    /// Darkness; rust spreads fastest and roads decay hardest.
    Night,
}

impl Phase {
    /// All phases in cycle order.
    pub const ALL: [Self; 4] = [Self::Dawn, Self::Day, Self::Dusk, Self::Night];

    /// The phase that follows this one, wrapping night back to dawn.
    pub const fn next(self) -> Self {
        match self {
            Self::Dawn => Self::Day,
            Self::Day => Self::Dusk,
            Self::Dusk => Self::Night,
            Self::Night => Self::Dawn,
        }
    }

    /// Stable lowercase name used in storage and payloads.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dawn => "dawn",
            Self::Day => "day",
            Self::Dusk => "dusk",
            Self::Night => "night",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dawn" => Ok(Self::Dawn),
            "day" => Ok(Self::Day),
            "dusk" => Ok(Self::Dusk),
            "night" => Ok(Self::Night),
            other => Err(UnknownVariant::new("phase", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Infrastructure
// ---------------------------------------------------------------------------

/// Functional class of a road, ordered from most to least important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum RoadClass {
    /// Limited-access highway.
    Motorway,
    /// Major arterial between districts.
    Trunk,
    /// Primary city street.
    Primary,
    /// Secondary street.
    Secondary,
    /// Tertiary connector.
    Tertiary,
    /// Residential street.
    Residential,
    /// Service lane, alley, or access road.
    Service,
}

impl RoadClass {
    /// Every road class, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Motorway,
        Self::Trunk,
        Self::Primary,
        Self::Secondary,
        Self::Tertiary,
        Self::Residential,
        Self::Service,
    ];

    /// Stable lowercase name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Motorway => "motorway",
            Self::Trunk => "trunk",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Tertiary => "tertiary",
            Self::Residential => "residential",
            Self::Service => "service",
        }
    }
}

impl FromStr for RoadClass {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("road class", s))
    }
}

/// Whether a feature is a road or a building.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// A road segment that decays and is repaired.
    Road,
    /// A building that may generate resources.
    Building,
}

/// Maintenance status of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// Health at or above the degraded threshold.
    Normal,
    /// Health below the degraded threshold.
    Degraded,
    /// A crew is on site; decay is suspended.
    Repairing,
}

impl FeatureStatus {
    /// Stable lowercase name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Degraded => "degraded",
            Self::Repairing => "repairing",
        }
    }
}

impl FromStr for FeatureStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "degraded" => Ok(Self::Degraded),
            "repairing" => Ok(Self::Repairing),
            other => Err(UnknownVariant::new("feature status", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

/// Lifecycle of a repair task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a crew.
    Queued,
    /// Claimed by a crew that is traveling to or working on it.
    Active,
    /// Completed. Terminal.
    Done,
}

impl TaskStatus {
    /// Whether the task can no longer change state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }

    /// Stable lowercase name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Done => "done",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "done" => Ok(Self::Done),
            other => Err(UnknownVariant::new("task status", other)),
        }
    }
}

/// Coarse crew status as stored in the `crews.status` column.
///
/// The richer [`CrewState`](crate::CrewState) carries the data each status
/// requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum CrewStatus {
    /// At the hub, available for dispatch.
    Idle,
    /// En route to a task.
    Traveling,
    /// Repairing a road.
    Working,
    /// Heading back to the hub.
    Returning,
}

impl CrewStatus {
    /// Stable lowercase name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Traveling => "traveling",
            Self::Working => "working",
            Self::Returning => "returning",
        }
    }
}

impl FromStr for CrewStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "traveling" => Ok(Self::Traveling),
            "working" => Ok(Self::Working),
            "returning" => Ok(Self::Returning),
            other => Err(UnknownVariant::new("crew status", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// One of the four pooled resource categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    /// Crew rations.
    Food,
    /// Tools and machinery.
    Equipment,
    /// Fuel and power.
    Energy,
    /// Asphalt, gravel, steel.
    Materials,
}

impl ResourceCategory {
    /// All categories in declaration order.
    pub const ALL: [Self; 4] = [Self::Food, Self::Equipment, Self::Energy, Self::Materials];

    /// Stable lowercase name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Food => "food",
            Self::Equipment => "equipment",
            Self::Energy => "energy",
            Self::Materials => "materials",
        }
    }
}

impl FromStr for ResourceCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("resource category", s))
    }
}

/// Lifecycle of a resource transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Departed, not yet credited.
    InTransit,
    /// Credited to the region pool. Terminal.
    Arrived,
}

impl TransferStatus {
    /// Stable lowercase name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InTransit => "in_transit",
            Self::Arrived => "arrived",
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// The fixed allow-list of notification channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Phase transitions.
    Phase,
    /// Hex, feature, task, crew and region changes.
    WorldDelta,
    /// Narrative events for the activity feed.
    Feed,
    /// Per-tick summary.
    Tick,
}

impl Channel {
    /// Every allowed channel.
    pub const ALL: [Self; 4] = [Self::Phase, Self::WorldDelta, Self::Feed, Self::Tick];

    /// The wire name of the channel.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Phase => "phase",
            Self::WorldDelta => "world_delta",
            Self::Feed => "feed",
            Self::Tick => "tick",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("channel", s))
    }
}

/// Kind of a narrative feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// The day cycle moved to a new phase.
    PhaseChanged,
    /// A road dropped below the degraded threshold.
    RoadDegraded,
    /// A road reached zero health.
    RoadFailed,
    /// A repair task was queued.
    TaskSpawned,
    /// A crew left the hub for a task.
    CrewDispatched,
    /// A crew arrived on site and started work.
    RepairStarted,
    /// A crew finished a repair.
    RepairCompleted,
    /// A crew got back to its hub.
    CrewReturned,
    /// Resource transfers were credited to a region.
    ResourcesDelivered,
}

impl FeedKind {
    /// Stable lowercase name used in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PhaseChanged => "phase_changed",
            Self::RoadDegraded => "road_degraded",
            Self::RoadFailed => "road_failed",
            Self::TaskSpawned => "task_spawned",
            Self::CrewDispatched => "crew_dispatched",
            Self::RepairStarted => "repair_started",
            Self::RepairCompleted => "repair_completed",
            Self::CrewReturned => "crew_returned",
            Self::ResourcesDelivered => "resources_delivered",
        }
    }
}

// ---------------------------------------------------------------------------
// Parse error
// ---------------------------------------------------------------------------

/// A stored or received string did not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_cycle_wraps() {
        assert_eq!(Phase::Night.next(), Phase::Dawn);
        let mut phase = Phase::Dawn;
        for _ in 0..4 {
            phase = phase.next();
        }
        assert_eq!(phase, Phase::Dawn);
    }

    #[test]
    fn road_class_parses_every_name() {
        for class in RoadClass::ALL {
            assert_eq!(class.as_str().parse::<RoadClass>().ok(), Some(class));
        }
        assert!("footpath".parse::<RoadClass>().is_err());
    }

    #[test]
    fn channel_rejects_unknown_names() {
        assert_eq!("feed".parse::<Channel>().ok(), Some(Channel::Feed));
        let err = "admin".parse::<Channel>().err();
        assert!(err.is_some_and(|e| e.to_string().contains("admin")));
    }

    #[test]
    fn serde_names_match_storage_names() {
        let json = serde_json::to_string(&CrewStatus::Returning).ok();
        assert_eq!(json.as_deref(), Some("\"returning\""));
        let json = serde_json::to_string(&Channel::WorldDelta).ok();
        assert_eq!(json.as_deref(), Some("\"world_delta\""));
    }
}
