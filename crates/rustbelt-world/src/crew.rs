//! Crew task selection and repair arithmetic.
//!
//! The persistence layer does its own selection in SQL; these functions are
//! the same rules for in-memory worlds and for tests.

use std::cmp::Ordering;

use rustbelt_types::{FeatureId, FeatureState, GeoPoint, PhaseMultipliers, ResourceAmounts, TaskId};

use crate::convert::ceil_i64;
use crate::decay::{DecayParams, status_for_health};

/// Tuning for crew work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrewParams {
    /// Rust removed from each touched hex on completion, before phase scaling.
    pub completion_pushback: f64,
    /// Phase spread multiplier above which completion pushback stops.
    pub pushback_ceiling: f64,
    /// Cells covered by one crew when sizing a region's roster.
    pub hexes_per_crew: u32,
    /// Roster floor per region.
    pub min_crews_per_region: u32,
}

impl Default for CrewParams {
    fn default() -> Self {
        Self {
            completion_pushback: 0.02,
            pushback_ceiling: 1.5,
            hexes_per_crew: 40,
            min_crews_per_region: 1,
        }
    }
}

/// A queued task as seen by the selector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskCandidate {
    /// Task.
    pub task_id: TaskId,
    /// Target road.
    pub feature_id: FeatureId,
    /// Road position.
    pub position: GeoPoint,
    /// Dispatch cost.
    pub costs: ResourceAmounts,
    /// Road class priority weight.
    pub class_weight: f64,
    /// Current road health.
    pub health: f64,
}

/// Ordering used to pick the next task: nearest first, then heavier road
/// class, then lower health, then task ID for determinism.
pub fn candidate_order(from: GeoPoint, a: &TaskCandidate, b: &TaskCandidate) -> Ordering {
    a.position
        .squared_distance(from)
        .total_cmp(&b.position.squared_distance(from))
        .then_with(|| b.class_weight.total_cmp(&a.class_weight))
        .then_with(|| a.health.total_cmp(&b.health))
        .then_with(|| a.task_id.cmp(&b.task_id))
}

/// The best affordable candidate for a crew at `from`.
pub fn select_task<'a>(
    candidates: impl IntoIterator<Item = &'a TaskCandidate>,
    from: GeoPoint,
    pools: &ResourceAmounts,
) -> Option<&'a TaskCandidate> {
    candidates
        .into_iter()
        .filter(|c| pools.covers(&c.costs))
        .min_by(|a, b| candidate_order(from, a, b))
}

/// On-site time for a repair, at least one second.
pub fn repair_duration_secs(base_duration_secs: i64, phase: &PhaseMultipliers) -> i64 {
    let scaled = if phase.repair_speed > 0.0 {
        ceil_i64(base_duration_secs as f64 / phase.repair_speed)
    } else {
        base_duration_secs
    };
    scaled.max(1)
}

/// Rust removed from each hex a finished road touches.
pub fn completion_pushback(phase: &PhaseMultipliers, params: &CrewParams) -> f64 {
    (params.completion_pushback * (params.pushback_ceiling - phase.rust_spread).max(0.0)).max(0.0)
}

/// Road state after a repair of `repair_amount` completes.
pub fn healed_state(before: FeatureState, repair_amount: f64, params: &DecayParams) -> FeatureState {
    let health = (before.health + repair_amount.max(0.0)).min(100.0);
    FeatureState {
        health,
        status: status_for_health(health, params),
    }
}

/// Roster size for a region of `hex_count` cells.
pub fn target_crew_count(hex_count: u32, params: &CrewParams) -> u32 {
    let per = params.hexes_per_crew.max(1);
    hex_count.div_ceil(per).max(params.min_crews_per_region)
}

#[cfg(test)]
mod tests {
    use rustbelt_types::FeatureStatus;

    use super::*;

    fn candidate(lon: f64, weight: f64, health: f64, cost: i64) -> TaskCandidate {
        TaskCandidate {
            task_id: TaskId::new(),
            feature_id: FeatureId::new(),
            position: GeoPoint::new(lon, 0.0),
            costs: ResourceAmounts::uniform(cost),
            class_weight: weight,
            health,
        }
    }

    #[test]
    fn nearest_affordable_wins() {
        let near_expensive = candidate(0.001, 1.0, 10.0, 500);
        let near = candidate(0.002, 1.0, 50.0, 10);
        let far = candidate(0.01, 3.0, 5.0, 10);
        let pools = ResourceAmounts::uniform(100);
        let all = [near_expensive, near, far];
        let picked = select_task(&all, GeoPoint::default(), &pools);
        assert_eq!(picked.map(|c| c.task_id), Some(near.task_id));
    }

    #[test]
    fn ties_break_on_class_then_health() {
        let light = candidate(0.001, 1.0, 10.0, 1);
        let heavy_healthy = candidate(0.001, 2.0, 60.0, 1);
        let heavy_broken = candidate(0.001, 2.0, 20.0, 1);
        let all = [light, heavy_healthy, heavy_broken];
        let picked = select_task(&all, GeoPoint::default(), &ResourceAmounts::uniform(10));
        assert_eq!(picked.map(|c| c.task_id), Some(heavy_broken.task_id));
    }

    #[test]
    fn nothing_affordable_selects_nothing() {
        let all = [candidate(0.0, 1.0, 10.0, 11)];
        assert!(select_task(&all, GeoPoint::default(), &ResourceAmounts::uniform(10)).is_none());
    }

    #[test]
    fn repair_duration_has_floor() {
        let fast = PhaseMultipliers {
            repair_speed: 1000.0,
            ..PhaseMultipliers::NEUTRAL
        };
        assert_eq!(repair_duration_secs(120, &fast), 1);
        let day = PhaseMultipliers {
            repair_speed: 1.25,
            ..PhaseMultipliers::NEUTRAL
        };
        assert_eq!(repair_duration_secs(120, &day), 96);
    }

    #[test]
    fn completion_heals_and_pushes_back() {
        let day = PhaseMultipliers {
            rust_spread: 0.1,
            ..PhaseMultipliers::NEUTRAL
        };
        let after = healed_state(
            FeatureState {
                health: 50.0,
                status: FeatureStatus::Repairing,
            },
            25.0,
            &DecayParams::default(),
        );
        assert!((after.health - 75.0).abs() < f64::EPSILON);
        assert_eq!(after.status, FeatureStatus::Normal);
        assert!((completion_pushback(&day, &CrewParams::default()) - 0.028).abs() < 1e-12);
    }

    #[test]
    fn heal_caps_at_full_health() {
        let after = healed_state(FeatureState::PRISTINE, 40.0, &DecayParams::default());
        assert!((after.health - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roster_size_rounds_up_with_floor() {
        let params = CrewParams::default();
        assert_eq!(target_crew_count(0, &params), 1);
        assert_eq!(target_crew_count(41, &params), 2);
        assert_eq!(target_crew_count(80, &params), 2);
    }
}
