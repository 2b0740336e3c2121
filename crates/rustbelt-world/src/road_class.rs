//! Per-road-class tuning: decay rate, repair priority, repair costs.
//!
//! [`RoadClassTable`] has one field per [`RoadClass`] so a lookup is an
//! exhaustive `match`; adding a class without a profile does not compile.

use serde::{Deserialize, Serialize};

use rustbelt_types::{ResourceAmounts, RoadClass};

/// Tuning values for one road class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoadClassProfile {
    /// Health lost per tick at multiplier 1 on a rust-free road.
    pub decay_rate: f64,
    /// Multiplier on missing health when computing priority.
    pub priority_weight: f64,
    /// Resources debited when a crew is dispatched.
    pub costs: ResourceAmounts,
    /// Base on-site repair time in seconds.
    pub duration_secs: i64,
    /// Health restored when the repair completes.
    pub repair_amount: f64,
}

impl RoadClassProfile {
    const fn new(decay_rate: f64, priority_weight: f64, cost: i64, duration_secs: i64, repair_amount: f64) -> Self {
        Self {
            decay_rate,
            priority_weight,
            costs: ResourceAmounts::uniform(cost),
            duration_secs,
            repair_amount,
        }
    }
}

/// Profiles for every road class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoadClassTable {
    /// Motorways.
    pub motorway: RoadClassProfile,
    /// Trunk roads.
    pub trunk: RoadClassProfile,
    /// Primary roads.
    pub primary: RoadClassProfile,
    /// Secondary roads.
    pub secondary: RoadClassProfile,
    /// Tertiary roads.
    pub tertiary: RoadClassProfile,
    /// Residential streets.
    pub residential: RoadClassProfile,
    /// Service roads.
    pub service: RoadClassProfile,
}

impl Default for RoadClassTable {
    fn default() -> Self {
        Self {
            motorway: RoadClassProfile::new(0.05, 3.0, 40, 240, 40.0),
            trunk: RoadClassProfile::new(0.06, 2.5, 35, 210, 35.0),
            primary: RoadClassProfile::new(0.08, 2.0, 25, 180, 30.0),
            secondary: RoadClassProfile::new(0.10, 1.5, 20, 150, 25.0),
            tertiary: RoadClassProfile::new(0.12, 1.25, 15, 120, 25.0),
            residential: RoadClassProfile::new(0.15, 1.0, 10, 90, 25.0),
            service: RoadClassProfile::new(0.20, 0.75, 5, 60, 30.0),
        }
    }
}

impl RoadClassTable {
    /// Profile for a class.
    pub const fn get(&self, class: RoadClass) -> &RoadClassProfile {
        match class {
            RoadClass::Motorway => &self.motorway,
            RoadClass::Trunk => &self.trunk,
            RoadClass::Primary => &self.primary,
            RoadClass::Secondary => &self.secondary,
            RoadClass::Tertiary => &self.tertiary,
            RoadClass::Residential => &self.residential,
            RoadClass::Service => &self.service,
        }
    }

    /// Profile for an optional class; unclassified roads use `residential`.
    pub const fn get_or_default(&self, class: Option<RoadClass>) -> &RoadClassProfile {
        match class {
            Some(c) => self.get(c),
            None => &self.residential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busier_roads_weigh_more() {
        let table = RoadClassTable::default();
        let weights: Vec<f64> = RoadClass::ALL
            .iter()
            .map(|&c| table.get(c).priority_weight)
            .collect();
        assert!(weights.windows(2).all(|w| matches!(w, [a, b] if a > b)));
    }

    #[test]
    fn unclassified_roads_fall_back_to_residential() {
        let table = RoadClassTable::default();
        assert_eq!(table.get_or_default(None), table.get(RoadClass::Residential));
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let json = r#"{"service": {"decay_rate": 1.0, "priority_weight": 0.5,
            "costs": {"food": 1, "equipment": 2, "energy": 3, "materials": 4},
            "duration_secs": 30, "repair_amount": 50.0}}"#;
        let table: Result<RoadClassTable, _> = serde_json::from_str(json);
        assert!(table.is_ok());
        let table = table.unwrap_or_default();
        assert!((table.service.decay_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(table.motorway, RoadClassTable::default().motorway);
    }
}
