//! Task priority and vote decay.
//!
//! A vote's influence halves every `half_life_hours`:
//!
//! ```text
//! vote_score     = sum(weight * exp(-lambda * hours_since_vote)),  lambda = ln 2 / half_life
//! priority_score = (100 - health) * class_priority_weight + vote_score
//! ```
//!
//! Priority therefore keeps moving even when nobody votes: old upvotes fade
//! and downvotes age out, while damage and road class stay as the baseline.

use chrono::{DateTime, Utc};

use crate::error::WorldError;

/// Default vote half-life in hours.
pub const DEFAULT_HALF_LIFE_HOURS: f64 = 7.0;

/// Exponential vote decay with a fixed rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoteDecay {
    lambda_per_hour: f64,
}

impl VoteDecay {
    /// Decay with the given half-life.
    pub fn from_half_life_hours(half_life_hours: f64) -> Result<Self, WorldError> {
        if !half_life_hours.is_finite() || half_life_hours <= 0.0 {
            return Err(WorldError::InvalidParameter {
                name: "tasks.vote_half_life_hours",
                value: half_life_hours,
            });
        }
        Ok(Self {
            lambda_per_hour: std::f64::consts::LN_2 / half_life_hours,
        })
    }

    /// Decay rate per hour.
    pub const fn lambda_per_hour(&self) -> f64 {
        self.lambda_per_hour
    }

    /// Remaining weight of one vote cast at `cast_at`. Future timestamps
    /// count as cast now.
    pub fn decayed(&self, weight: f64, cast_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let hours = ((now - cast_at).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
        weight * (-self.lambda_per_hour * hours).exp()
    }

    /// Sum of decayed weights.
    pub fn score<I>(&self, votes: I, now: DateTime<Utc>) -> f64
    where
        I: IntoIterator<Item = (f64, DateTime<Utc>)>,
    {
        votes.into_iter().map(|(w, at)| self.decayed(w, at, now)).sum()
    }
}

impl Default for VoteDecay {
    fn default() -> Self {
        Self {
            lambda_per_hour: std::f64::consts::LN_2 / DEFAULT_HALF_LIFE_HOURS,
        }
    }
}

/// Priority from damage and road class alone.
pub fn baseline_priority(health: f64, class_priority_weight: f64) -> f64 {
    (100.0 - health.clamp(0.0, 100.0)) * class_priority_weight
}

/// Full priority score.
pub fn priority_score(health: f64, class_priority_weight: f64, vote_score: f64) -> f64 {
    baseline_priority(health, class_priority_weight) + vote_score
}

/// Accept a vote weight only if it is finite and non-zero.
pub fn validate_vote_weight(weight: f64) -> Result<f64, WorldError> {
    if weight.is_finite() && weight != 0.0 {
        Ok(weight)
    } else {
        Err(WorldError::InvalidVoteWeight(weight))
    }
}
