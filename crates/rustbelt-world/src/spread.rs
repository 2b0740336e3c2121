//! Rust spread over the hex grid.
//!
//! One pass reads a snapshot of every cell and returns the cells whose level
//! moved by more than `epsilon`. All neighbor maxima are taken from the
//! snapshot, so the order cells are visited in does not matter.
//!
//! Per cell with a positive center rank:
//!
//! ```text
//! spread   = base_rate * (neighbor_max - own) * phase.rust_spread   (when neighbor_max > own)
//! pushback = pushback_rate * healthy_fraction * max(0, pushback_ceiling - phase.rust_spread)
//! next     = clamp(own + spread - pushback, 0, max_rust)
//! ```
//!
//! Center cells (rank 0) receive no spread; they still get pushback.

use std::collections::BTreeMap;

use rustbelt_types::{
    Feature, FeatureKind, FeatureState, FeatureId, HexCell, HexDelta, HexId, PhaseMultipliers,
};

use crate::hex::NeighborLookup;

/// Tuning constants for the spread pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadParams {
    /// Fraction of the neighbor gap closed per tick at multiplier 1.
    pub base_rate: f64,
    /// Pushback per tick from a fully healthy cell at multiplier 0.
    pub pushback_rate: f64,
    /// Phase spread multiplier above which pushback stops.
    pub pushback_ceiling: f64,
    /// Upper bound on any cell's rust level.
    pub max_rust: f64,
    /// Changes at or below this are not written back.
    pub epsilon: f64,
    /// Roads above this health count as healthy.
    pub healthy_road_health: f64,
}

impl Default for SpreadParams {
    fn default() -> Self {
        Self {
            base_rate: 0.02,
            pushback_rate: 0.005,
            pushback_ceiling: 1.5,
            max_rust: 0.95,
            epsilon: 1e-6,
            healthy_road_health: 80.0,
        }
    }
}

/// Healthy and total road counts for roads terminating in a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoadTally {
    /// Roads above the healthy threshold.
    pub healthy: u32,
    /// All roads.
    pub total: u32,
}

impl RoadTally {
    /// `healthy / total`, or 0 for a cell with no roads.
    pub fn healthy_fraction(self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.healthy) / f64::from(self.total)
        }
    }
}

/// Count roads per terminal cell.
///
/// A road terminates in the first and last cells of its hex list (the same
/// cell once for roads contained in one hex). Roads without state are
/// skipped.
pub fn tally_road_termini(
    features: &[Feature],
    states: &BTreeMap<FeatureId, FeatureState>,
    healthy_threshold: f64,
) -> BTreeMap<HexId, RoadTally> {
    let mut tallies: BTreeMap<HexId, RoadTally> = BTreeMap::new();
    for feature in features.iter().filter(|f| f.kind == FeatureKind::Road) {
        let Some(state) = states.get(&feature.id) else {
            continue;
        };
        let healthy = state.health > healthy_threshold;
        let mut termini: Vec<HexId> = feature.hexes.first().into_iter().copied().collect();
        if let Some(&last) = feature.hexes.last() {
            if !termini.contains(&last) {
                termini.push(last);
            }
        }
        for hex in termini {
            let tally = tallies.entry(hex).or_default();
            tally.total = tally.total.saturating_add(1);
            if healthy {
                tally.healthy = tally.healthy.saturating_add(1);
            }
        }
    }
    tallies
}

/// Compute one spread pass and return the changed cells.
pub fn spread_rust(
    cells: &[HexCell],
    lookup: &impl NeighborLookup,
    road_tallies: &BTreeMap<HexId, RoadTally>,
    phase: &PhaseMultipliers,
    params: &SpreadParams,
) -> Vec<HexDelta> {
    let levels: BTreeMap<HexId, f64> = cells.iter().map(|c| (c.id, c.rust_level)).collect();
    let pushback_factor = (params.pushback_ceiling - phase.rust_spread).max(0.0);

    cells
        .iter()
        .filter_map(|cell| {
            let own = cell.rust_level;
            let spread = if cell.center_rank > 0 {
                let neighbor_max = lookup
                    .neighbors_of(cell.id)
                    .iter()
                    .filter_map(|n| levels.get(n).copied())
                    .fold(f64::NEG_INFINITY, f64::max);
                if neighbor_max > own {
                    params.base_rate * (neighbor_max - own) * phase.rust_spread
                } else {
                    0.0
                }
            } else {
                0.0
            };

            let healthy_fraction = road_tallies
                .get(&cell.id)
                .map_or(0.0, |t| t.healthy_fraction());
            let pushback = params.pushback_rate * healthy_fraction * pushback_factor;

            let next = (own + spread.max(0.0) - pushback).clamp(0.0, params.max_rust);
            ((next - own).abs() > params.epsilon).then_some(HexDelta {
                hex_id: cell.id,
                rust_level: next,
            })
        })
        .collect()
}

/// Apply completion pushback to a rust level, floored at zero.
pub fn apply_pushback(rust_level: f64, amount: f64) -> f64 {
    (rust_level - amount).max(0.0)
}

#[cfg(test)]
mod tests {
    use rustbelt_types::{FeatureStatus, GeoPoint, RegionId};

    use super::*;
    use crate::hex::AxialGrid;

    fn cell(q: i32, r: i32, rank: u32, rust: f64) -> HexCell {
        HexCell {
            id: HexId::new(),
            region_id: RegionId::new(),
            q,
            r,
            rust_level: rust,
            center_rank: rank,
        }
    }

    fn night() -> PhaseMultipliers {
        PhaseMultipliers {
            rust_spread: 1.5,
            decay: 1.5,
            generation: 3.0,
            repair_speed: 0.75,
        }
    }

    #[test]
    fn spread_moves_toward_rustier_neighbor() {
        let cells = [cell(0, 0, 1, 0.1), cell(1, 0, 2, 0.9)];
        let grid = AxialGrid::from_cells(&cells);
        let deltas = spread_rust(&cells, &grid, &BTreeMap::new(), &night(), &SpreadParams::default());

        assert_eq!(deltas.len(), 1);
        let delta = deltas.first().copied();
        // 0.1 + 0.02 * 0.8 * 1.5
        assert!(delta.is_some_and(|d| (d.rust_level - 0.124).abs() < 1e-9));
    }

    #[test]
    fn center_cells_never_gain_rust() {
        let cells = [cell(0, 0, 0, 0.0), cell(1, 0, 1, 0.95)];
        let grid = AxialGrid::from_cells(&cells);
        let deltas = spread_rust(&cells, &grid, &BTreeMap::new(), &night(), &SpreadParams::default());
        assert!(deltas.is_empty());
    }

    #[test]
    fn levels_stay_within_bounds_over_many_passes() {
        let mut cells: Vec<HexCell> = (0..5).map(|q| cell(q, 0, u32::try_from(q).unwrap_or(0), 0.0)).collect();
        if let Some(last) = cells.last_mut() {
            last.rust_level = 0.95;
        }
        let params = SpreadParams {
            base_rate: 0.9,
            ..SpreadParams::default()
        };
        let grid = AxialGrid::from_cells(&cells);
        let phase = night().scaled(4.0);
        for _ in 0..200 {
            for delta in spread_rust(&cells, &grid, &BTreeMap::new(), &phase, &params) {
                if let Some(c) = cells.iter_mut().find(|c| c.id == delta.hex_id) {
                    c.rust_level = delta.rust_level;
                }
            }
        }
        for c in &cells {
            assert!((0.0..=0.95).contains(&c.rust_level), "rust out of bounds: {}", c.rust_level);
        }
        assert!(cells.first().is_some_and(|c| c.rust_level.abs() < f64::EPSILON));
    }

    #[test]
    fn healthy_roads_push_rust_back() {
        let target = cell(0, 0, 1, 0.5);
        let cells = [target];
        let mut tallies = BTreeMap::new();
        tallies.insert(target.id, RoadTally { healthy: 1, total: 2 });
        let day = PhaseMultipliers {
            rust_spread: 0.1,
            ..PhaseMultipliers::NEUTRAL
        };
        let deltas = spread_rust(&cells, &AxialGrid::default(), &tallies, &day, &SpreadParams::default());
        // 0.5 - 0.005 * 0.5 * 1.4
        assert!(deltas.first().is_some_and(|d| (d.rust_level - 0.4965).abs() < 1e-9));
    }

    #[test]
    fn tally_counts_each_terminus_once() {
        let a = HexId::new();
        let b = HexId::new();
        let road = Feature {
            id: FeatureId::new(),
            region_id: RegionId::new(),
            kind: FeatureKind::Road,
            road_class: None,
            position: GeoPoint::default(),
            hexes: vec![a, HexId::new(), b],
            generates_resources: false,
        };
        let looped = Feature {
            id: FeatureId::new(),
            hexes: vec![a],
            ..road.clone()
        };
        let mut states = BTreeMap::new();
        states.insert(road.id, FeatureState::PRISTINE);
        states.insert(
            looped.id,
            FeatureState {
                health: 40.0,
                status: FeatureStatus::Degraded,
            },
        );

        let tallies = tally_road_termini(&[road, looped], &states, 80.0);
        assert_eq!(tallies.get(&a), Some(&RoadTally { healthy: 1, total: 2 }));
        assert_eq!(tallies.get(&b), Some(&RoadTally { healthy: 1, total: 1 }));
        assert_eq!(tallies.len(), 2);
    }

    #[test]
    fn pushback_floors_at_zero() {
        assert!(apply_pushback(0.01, 0.028).abs() < f64::EPSILON);
        assert!((apply_pushback(0.5, 0.028) - 0.472).abs() < 1e-12);
    }
}
