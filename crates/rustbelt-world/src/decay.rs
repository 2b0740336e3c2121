//! Road health decay and delta filtering.
//!
//! Decay per tick for one road:
//!
//! ```text
//! magnitude = class_decay_rate * (1 + avg_rust) * phase.decay * region_difficulty
//! ```
//!
//! Roads under repair do not decay. A road's change is only reported when
//! its status flips, its health crosses a bucket boundary, or it newly hits
//! zero; small continuous losses stay silent.

use std::collections::BTreeMap;

use rustbelt_types::{FeatureStatus, FeatureState, HexId};

use crate::convert::floor_i64;

/// Thresholds that shape road status and delta reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayParams {
    /// Health below this is `degraded`.
    pub degraded_threshold: f64,
    /// Width of the health buckets used to decide what is worth reporting.
    pub health_bucket: f64,
}

impl Default for DecayParams {
    fn default() -> Self {
        Self {
            degraded_threshold: 70.0,
            health_bucket: 10.0,
        }
    }
}

/// Outcome of decaying one road.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayOutcome {
    /// State after decay.
    pub state: FeatureState,
    /// Whether downstream consumers should hear about it.
    pub notable: bool,
    /// Whether health reached zero on this tick.
    pub failed: bool,
}

/// Health lost this tick.
pub fn decay_magnitude(class_decay_rate: f64, avg_rust: f64, phase_decay: f64, region_difficulty: f64) -> f64 {
    (class_decay_rate * (1.0 + avg_rust) * phase_decay * region_difficulty).max(0.0)
}

/// Mean rust over the given cells. Unknown cells are ignored; no known
/// cells means zero.
pub fn average_rust(hexes: &[HexId], rust: &BTreeMap<HexId, f64>) -> f64 {
    let (sum, count) = hexes
        .iter()
        .filter_map(|h| rust.get(h))
        .fold((0.0, 0_u32), |(s, n), &r| (s + r, n.saturating_add(1)));
    if count == 0 { 0.0 } else { sum / f64::from(count) }
}

/// Status implied by a health value (never `repairing`).
pub fn status_for_health(health: f64, params: &DecayParams) -> FeatureStatus {
    if health < params.degraded_threshold {
        FeatureStatus::Degraded
    } else {
        FeatureStatus::Normal
    }
}

fn bucket(health: f64, params: &DecayParams) -> i64 {
    if params.health_bucket > 0.0 {
        floor_i64(health / params.health_bucket)
    } else {
        0
    }
}

/// Apply one tick of decay to a road.
///
/// Returns `None` for roads being repaired.
pub fn decay_road(before: FeatureState, magnitude: f64, params: &DecayParams) -> Option<DecayOutcome> {
    if before.status == FeatureStatus::Repairing {
        return None;
    }
    let health = (before.health - magnitude).clamp(0.0, 100.0);
    let state = FeatureState {
        health,
        status: status_for_health(health, params),
    };
    let failed = health <= 0.0 && before.health > 0.0;
    let notable = state.status != before.status || bucket(health, params) != bucket(before.health, params) || failed;
    Some(DecayOutcome { state, notable, failed })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn road(health: f64, status: FeatureStatus) -> FeatureState {
        FeatureState { health, status }
    }

    #[test]
    fn magnitude_scales_with_rust_and_difficulty() {
        let m = decay_magnitude(0.1, 0.5, 1.5, 2.0);
        assert!((m - 0.45).abs() < 1e-12);
    }

    #[test]
    fn repairing_roads_are_exempt() {
        assert!(decay_road(road(50.0, FeatureStatus::Repairing), 5.0, &DecayParams::default()).is_none());
    }

    #[test]
    fn small_loss_within_bucket_is_silent() {
        let out = decay_road(road(95.0, FeatureStatus::Normal), 0.5, &DecayParams::default());
        assert!(out.is_some_and(|o| !o.notable && (o.state.health - 94.5).abs() < 1e-12));
    }

    #[test]
    fn crossing_threshold_degrades_and_reports() {
        let out = decay_road(road(70.2, FeatureStatus::Normal), 0.5, &DecayParams::default());
        assert!(out.is_some_and(|o| o.notable && o.state.status == FeatureStatus::Degraded));
    }

    #[test]
    fn bucket_crossing_reports_without_status_change() {
        let out = decay_road(road(90.1, FeatureStatus::Normal), 0.2, &DecayParams::default());
        assert!(out.is_some_and(|o| o.notable && o.state.status == FeatureStatus::Normal));
    }

    #[test]
    fn hitting_zero_reports_once() {
        let params = DecayParams::default();
        let first = decay_road(road(0.3, FeatureStatus::Degraded), 1.0, &params);
        assert!(first.is_some_and(|o| o.failed && o.notable && o.state.health <= 0.0));

        let again = decay_road(road(0.0, FeatureStatus::Degraded), 1.0, &params);
        assert!(again.is_some_and(|o| !o.failed && !o.notable));
    }

    #[test]
    fn average_ignores_unknown_cells() {
        let a = HexId::new();
        let b = HexId::new();
        let rust = BTreeMap::from([(a, 0.2), (b, 0.4)]);
        assert!((average_rust(&[a, b, HexId::new()], &rust) - 0.3).abs() < 1e-12);
        assert!(average_rust(&[], &rust).abs() < f64::EPSILON);
    }
}
