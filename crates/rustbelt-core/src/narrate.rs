//! Feed event wording, shared by every backend.

use chrono::{DateTime, Utc};

use rustbelt_types::{
    CrewId, FeatureId, FeatureStatus, FeedEvent, FeedKind, PhaseChange, RegionId, TaskId,
};
use rustbelt_world::DecayOutcome;

/// A new phase started.
pub fn phase_began(change: &PhaseChange, now: DateTime<Utc>) -> FeedEvent {
    FeedEvent::new(FeedKind::PhaseChanged, None, None, format!("{} has begun", change.to), now)
}

/// A road crossed into degraded or failed. `None` for uneventful decay.
pub fn road_decayed(
    feature_id: FeatureId,
    region_id: RegionId,
    region_name: &str,
    before: FeatureStatus,
    outcome: &DecayOutcome,
    now: DateTime<Utc>,
) -> Option<FeedEvent> {
    if outcome.failed {
        return Some(FeedEvent::new(
            FeedKind::RoadFailed,
            Some(region_id),
            Some(feature_id.into_inner()),
            format!("A road in {region_name} has failed completely"),
            now,
        ));
    }
    (before != FeatureStatus::Degraded && outcome.state.status == FeatureStatus::Degraded).then(|| {
        FeedEvent::new(
            FeedKind::RoadDegraded,
            Some(region_id),
            Some(feature_id.into_inner()),
            format!("A road in {region_name} is degrading"),
            now,
        )
    })
}

/// A repair task was queued.
pub fn task_spawned(task_id: TaskId, region_id: RegionId, health: f64, now: DateTime<Utc>) -> FeedEvent {
    FeedEvent::new(
        FeedKind::TaskSpawned,
        Some(region_id),
        Some(task_id.into_inner()),
        format!("Repair queued for a road at {health:.0}% health"),
        now,
    )
}

/// A crew set off for a task. `chained` when it came straight from another
/// repair.
pub fn crew_dispatched(
    crew_id: CrewId,
    region_id: RegionId,
    travel_secs: i64,
    chained: bool,
    now: DateTime<Utc>,
) -> FeedEvent {
    let message = if chained {
        format!("The crew heads straight to the next job, arriving in {travel_secs}s")
    } else {
        format!("A crew is on its way, arriving in {travel_secs}s")
    };
    FeedEvent::new(FeedKind::CrewDispatched, Some(region_id), Some(crew_id.into_inner()), message, now)
}

/// A crew arrived on site.
pub fn repair_started(task_id: TaskId, region_id: RegionId, work_secs: i64, now: DateTime<Utc>) -> FeedEvent {
    FeedEvent::new(
        FeedKind::RepairStarted,
        Some(region_id),
        Some(task_id.into_inner()),
        format!("Repairs started, expected to take {work_secs}s"),
        now,
    )
}

/// A repair finished.
pub fn repair_completed(feature_id: FeatureId, region_id: RegionId, health: f64, now: DateTime<Utc>) -> FeedEvent {
    FeedEvent::new(
        FeedKind::RepairCompleted,
        Some(region_id),
        Some(feature_id.into_inner()),
        format!("Road repaired to {health:.0}% health"),
        now,
    )
}

/// A crew got home.
pub fn crew_returned(crew_id: CrewId, region_id: RegionId, now: DateTime<Utc>) -> FeedEvent {
    FeedEvent::new(
        FeedKind::CrewReturned,
        Some(region_id),
        Some(crew_id.into_inner()),
        "A crew is back at the hub",
        now,
    )
}

/// Transfers were credited to a hub.
pub fn resources_delivered(region_id: RegionId, region_name: &str, total: i64, now: DateTime<Utc>) -> FeedEvent {
    FeedEvent::new(
        FeedKind::ResourcesDelivered,
        Some(region_id),
        None,
        format!("{total} units of supplies reached the {region_name} hub"),
        now,
    )
}

#[cfg(test)]
mod tests {
    use rustbelt_types::FeatureState;

    use super::*;

    #[test]
    fn only_threshold_crossings_are_narrated() {
        let now = Utc::now();
        let degraded = DecayOutcome {
            state: FeatureState {
                health: 65.0,
                status: FeatureStatus::Degraded,
            },
            notable: true,
            failed: false,
        };
        let id = FeatureId::new();
        let region = RegionId::new();
        let first = road_decayed(id, region, "Eastside", FeatureStatus::Normal, &degraded, now);
        assert_eq!(first.map(|e| e.kind), Some(FeedKind::RoadDegraded));
        let again = road_decayed(id, region, "Eastside", FeatureStatus::Degraded, &degraded, now);
        assert!(again.is_none());
    }

    #[test]
    fn failure_always_narrated() {
        let failed = DecayOutcome {
            state: FeatureState {
                health: 0.0,
                status: FeatureStatus::Degraded,
            },
            notable: true,
            failed: true,
        };
        let event = road_decayed(
            FeatureId::new(),
            RegionId::new(),
            "Eastside",
            FeatureStatus::Degraded,
            &failed,
            Utc::now(),
        );
        assert_eq!(event.map(|e| e.kind), Some(FeedKind::RoadFailed));
    }
}
