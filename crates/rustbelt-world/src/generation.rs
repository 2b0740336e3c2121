//! Building output.
//!
//! Each resource-generating building yields, per category,
//! `max(0, floor((1 - local_rust) * phase.generation))`. Categories with
//! zero output produce no transfer.

use rustbelt_types::{PhaseMultipliers, ResourceCategory};

use crate::convert::floor_i64;

/// Output of one category for a building standing in `local_rust`.
pub fn category_output(local_rust: f64, phase_generation: f64) -> i64 {
    floor_i64((1.0 - local_rust.clamp(0.0, 1.0)) * phase_generation).max(0)
}

/// Positive `(category, amount)` outputs for one building this tick.
pub fn building_output(local_rust: f64, phase: &PhaseMultipliers) -> Vec<(ResourceCategory, i64)> {
    let amount = category_output(local_rust, phase.generation);
    if amount <= 0 {
        return Vec::new();
    }
    ResourceCategory::ALL.into_iter().map(|c| (c, amount)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_reduces_output() {
        assert_eq!(category_output(0.0, 10.0), 10);
        assert_eq!(category_output(0.25, 10.0), 7);
        assert_eq!(category_output(0.95, 10.0), 0);
    }

    #[test]
    fn zero_output_produces_nothing() {
        let phase = PhaseMultipliers {
            generation: 0.5,
            ..PhaseMultipliers::NEUTRAL
        };
        assert!(building_output(0.0, &phase).is_empty());
    }

    #[test]
    fn every_category_gets_output() {
        let phase = PhaseMultipliers {
            generation: 6.0,
            ..PhaseMultipliers::NEUTRAL
        };
        let out = building_output(0.5, &phase);
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|&(_, amount)| amount == 3));
    }
}
