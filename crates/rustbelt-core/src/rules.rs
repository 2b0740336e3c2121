//! Validated tuning values handed to every simulation step.

use chrono::{DateTime, Duration, Utc};

use rustbelt_types::ResourceAmounts;
use rustbelt_world::{CrewParams, DecayParams, RoadClassTable, SpreadParams, TravelParams, VoteDecay};

/// How long finished records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Feed events.
    pub feed_hours: u32,
    /// Arrived transfers.
    pub transfer_hours: u32,
    /// Done tasks.
    pub task_hours: u32,
    /// Statement time box for the cleanup deletes.
    pub statement_timeout_ms: u64,
}

impl RetentionPolicy {
    /// Cutoff for feed events.
    pub fn feed_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(i64::from(self.feed_hours))
    }

    /// Cutoff for arrived transfers.
    pub fn transfer_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(i64::from(self.transfer_hours))
    }

    /// Cutoff for done tasks.
    pub fn task_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(i64::from(self.task_hours))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            feed_hours: 24,
            transfer_hours: 6,
            task_hours: 72,
            statement_timeout_ms: 2_000,
        }
    }
}

/// Everything the steps need besides the clock.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldRules {
    /// Rust spread.
    pub spread: SpreadParams,
    /// Road status thresholds.
    pub decay: DecayParams,
    /// Travel estimation.
    pub travel: TravelParams,
    /// Crew work and roster sizing.
    pub crews: CrewParams,
    /// Per-class tuning.
    pub road_classes: RoadClassTable,
    /// Vote decay.
    pub vote_decay: VoteDecay,
    /// Pools after a world reset.
    pub starting_pools: ResourceAmounts,
    /// Cleanup windows.
    pub retention: RetentionPolicy,
}

impl Default for WorldRules {
    fn default() -> Self {
        Self {
            spread: SpreadParams::default(),
            decay: DecayParams::default(),
            travel: TravelParams::default(),
            crews: CrewParams::default(),
            road_classes: RoadClassTable::default(),
            vote_decay: VoteDecay::default(),
            starting_pools: ResourceAmounts::uniform(500),
            retention: RetentionPolicy::default(),
        }
    }
}
