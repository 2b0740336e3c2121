//! Per-tick change records ("deltas") forwarded to subscribers.
//!
//! Every simulation step returns a [`TickDelta`]. The orchestrator merges
//! them, collapses repeated entries for the same entity to the latest value,
//! and publishes the result as one batch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::enums::{CrewStatus, FeatureStatus, FeedKind, Phase, TaskStatus};
use crate::ids::{CrewId, FeatureId, FeedEventId, HexId, RegionId, TaskId};
use crate::structs::{GeoPoint, ResourceAmounts};

/// New rust level for one hex cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct HexDelta {
    /// Changed cell.
    pub hex_id: HexId,
    /// Rust level after the change.
    pub rust_level: f64,
}

/// New health/status for one feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct FeatureDelta {
    /// Changed feature.
    pub feature_id: FeatureId,
    /// Health after the change.
    pub health: f64,
    /// Status after the change.
    pub status: FeatureStatus,
}

/// New status/priority for one task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TaskDelta {
    /// Changed task.
    pub task_id: TaskId,
    /// Road the task targets.
    pub feature_id: FeatureId,
    /// Status after the change.
    pub status: TaskStatus,
    /// Priority after the change.
    pub priority_score: f64,
}

/// New state for one crew.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CrewDelta {
    /// Changed crew.
    pub crew_id: CrewId,
    /// Status after the change.
    pub status: CrewStatus,
    /// Claimed task, if traveling or working.
    pub active_task_id: Option<TaskId>,
    /// Position after the change.
    pub position: GeoPoint,
    /// End of the current leg.
    pub busy_until: Option<DateTime<Utc>>,
}

/// New pool balances for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RegionDelta {
    /// Changed region.
    pub region_id: RegionId,
    /// Balances after the change.
    pub pools: ResourceAmounts,
}

/// A narrative event for the activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct FeedEvent {
    /// Event identifier.
    pub id: FeedEventId,
    /// What happened.
    pub kind: FeedKind,
    /// Region concerned, if any.
    pub region_id: Option<RegionId>,
    /// Primary entity (road, task, crew) concerned, if any.
    pub subject_id: Option<Uuid>,
    /// Human-readable one-liner.
    pub message: String,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

impl FeedEvent {
    /// Create a feed event with a fresh ID.
    pub fn new(
        kind: FeedKind,
        region_id: Option<RegionId>,
        subject_id: Option<Uuid>,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: FeedEventId::new(),
            kind,
            region_id,
            subject_id,
            message: message.into(),
            occurred_at,
        }
    }
}

/// Payload of the `phase` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PhaseChange {
    /// Previously persisted phase, if the record existed.
    pub from: Option<Phase>,
    /// Phase now active.
    pub to: Phase,
    /// When the new phase started.
    pub phase_started_at: DateTime<Utc>,
}

/// All changes produced by one tick (or one step of it).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TickDelta {
    /// Hex cells whose rust changed.
    pub hexes: Vec<HexDelta>,
    /// Features whose status or health bucket changed.
    pub features: Vec<FeatureDelta>,
    /// Tasks that were created or changed.
    pub tasks: Vec<TaskDelta>,
    /// Crews that changed state.
    pub crews: Vec<CrewDelta>,
    /// Regions whose pools changed.
    pub regions: Vec<RegionDelta>,
    /// Narrative events.
    pub feed: Vec<FeedEvent>,
}

impl TickDelta {
    /// Append everything from `other`.
    pub fn merge(&mut self, other: Self) {
        self.hexes.extend(other.hexes);
        self.features.extend(other.features);
        self.tasks.extend(other.tasks);
        self.crews.extend(other.crews);
        self.regions.extend(other.regions);
        self.feed.extend(other.feed);
    }

    /// Collapse repeated entries per entity, keeping the latest value at the
    /// position where the entity first appeared.
    #[must_use]
    pub fn deduplicated(self) -> Self {
        Self {
            hexes: keep_latest(self.hexes, |d| d.hex_id),
            features: keep_latest(self.features, |d| d.feature_id),
            tasks: keep_latest(self.tasks, |d| d.task_id),
            crews: keep_latest(self.crews, |d| d.crew_id),
            regions: keep_latest(self.regions, |d| d.region_id),
            feed: keep_latest(self.feed, |e| e.id),
        }
    }

    /// Whether no world state changed. Feed events count as changes.
    pub fn is_empty(&self) -> bool {
        self.hexes.is_empty()
            && self.features.is_empty()
            && self.tasks.is_empty()
            && self.crews.is_empty()
            && self.regions.is_empty()
            && self.feed.is_empty()
    }

    /// Whether any entity (non-feed) changes are present.
    pub fn has_world_changes(&self) -> bool {
        !(self.hexes.is_empty()
            && self.features.is_empty()
            && self.tasks.is_empty()
            && self.crews.is_empty()
            && self.regions.is_empty())
    }

    /// Entry counts per section, for logging and the tick summary.
    pub fn counts(&self) -> DeltaCounts {
        DeltaCounts {
            hexes: self.hexes.len(),
            features: self.features.len(),
            tasks: self.tasks.len(),
            crews: self.crews.len(),
            regions: self.regions.len(),
            feed: self.feed.len(),
        }
    }
}

/// Number of entries per [`TickDelta`] section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DeltaCounts {
    /// Hex entries.
    pub hexes: usize,
    /// Feature entries.
    pub features: usize,
    /// Task entries.
    pub tasks: usize,
    /// Crew entries.
    pub crews: usize,
    /// Region entries.
    pub regions: usize,
    /// Feed entries.
    pub feed: usize,
}

fn keep_latest<T, K: Ord>(items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut slot_by_key: BTreeMap<K, usize> = BTreeMap::new();
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        let k = key(&item);
        if let Some(&slot) = slot_by_key.get(&k) {
            if let Some(existing) = out.get_mut(slot) {
                *existing = item;
            }
        } else {
            slot_by_key.insert(k, out.len());
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_latest_value_in_first_position() {
        let a = HexId::new();
        let b = HexId::new();
        let mut delta = TickDelta {
            hexes: vec![
                HexDelta { hex_id: a, rust_level: 0.1 },
                HexDelta { hex_id: b, rust_level: 0.2 },
            ],
            ..TickDelta::default()
        };
        delta.merge(TickDelta {
            hexes: vec![HexDelta { hex_id: a, rust_level: 0.05 }],
            ..TickDelta::default()
        });

        let deduped = delta.deduplicated();
        assert_eq!(deduped.hexes.len(), 2);
        assert_eq!(deduped.hexes.first().map(|d| d.hex_id), Some(a));
        assert!(deduped.hexes.first().is_some_and(|d| (d.rust_level - 0.05).abs() < 1e-12));
    }

    #[test]
    fn empty_delta_reports_empty() {
        let delta = TickDelta::default();
        assert!(delta.is_empty());
        assert!(!delta.has_world_changes());
        assert_eq!(delta.counts(), DeltaCounts::default());
    }
}
