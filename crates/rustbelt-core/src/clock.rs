//! Day cycle clock.
//!
//! The phase is never stored as the source of truth. It is derived from
//! the persisted cycle start and the current time:
//!
//! ```text
//! elapsed = (now - cycle_started_at) rem_euclid cycle_length
//! ```
//!
//! then a linear scan over the phase lengths. The persisted
//! [`CycleRecord`] is only rewritten when the phase changes, when the
//! stored phase start has drifted from the computed one, or when the
//! record is missing or malformed. That keeps writes to one per phase
//! rather than one per tick.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use rustbelt_types::{Phase, PhaseChange, PhaseMultipliers};

use crate::config::CycleConfig;

/// Stored phase start may differ from the computed one by this much before
/// it is rewritten.
const DRIFT_TOLERANCE_MS: i64 = 1_000;

/// Errors from clock construction.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// Phase lengths or multipliers are unusable.
    #[error("invalid cycle configuration: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },
}

/// Multipliers for each phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseMultiplierTable {
    /// Dawn.
    pub dawn: PhaseMultipliers,
    /// Day.
    pub day: PhaseMultipliers,
    /// Dusk.
    pub dusk: PhaseMultipliers,
    /// Night.
    pub night: PhaseMultipliers,
}

impl PhaseMultiplierTable {
    /// Multipliers for one phase.
    pub const fn get(&self, phase: Phase) -> PhaseMultipliers {
        match phase {
            Phase::Dawn => self.dawn,
            Phase::Day => self.day,
            Phase::Dusk => self.dusk,
            Phase::Night => self.night,
        }
    }
}

impl Default for PhaseMultiplierTable {
    fn default() -> Self {
        Self {
            dawn: PhaseMultipliers {
                rust_spread: 0.3,
                decay: 0.8,
                generation: 6.0,
                repair_speed: 1.0,
            },
            day: PhaseMultipliers {
                rust_spread: 0.1,
                decay: 0.5,
                generation: 10.0,
                repair_speed: 1.25,
            },
            dusk: PhaseMultipliers {
                rust_spread: 0.6,
                decay: 1.0,
                generation: 6.0,
                repair_speed: 1.0,
            },
            night: PhaseMultipliers {
                rust_spread: 1.5,
                decay: 1.5,
                generation: 3.0,
                repair_speed: 0.75,
            },
        }
    }
}

/// The derived view of where we are in the cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseView {
    /// Active phase.
    pub phase: Phase,
    /// Phase that follows.
    pub next_phase: Phase,
    /// Time since the phase started.
    pub elapsed: Duration,
    /// Time until the next phase.
    pub remaining: Duration,
    /// `elapsed / phase length`, in `[0, 1)`.
    pub progress: f64,
    /// Wall time the phase started.
    pub phase_started_at: DateTime<Utc>,
    /// Multipliers in effect (demo scaling applied).
    pub multipliers: PhaseMultipliers,
}

/// The persisted cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Phase at the last write.
    pub phase: Phase,
    /// When that phase started.
    pub phase_started_at: DateTime<Utc>,
    /// Anchor for all phase computation.
    pub cycle_started_at: DateTime<Utc>,
}

/// Lenient shape used to read a record that may be partial or corrupt.
#[derive(Debug, Default, Deserialize)]
struct StoredRecord {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    phase_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    cycle_started_at: Option<DateTime<Utc>>,
}

/// Result of reconciling the stored record with the current time.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    /// Current phase view.
    pub view: PhaseView,
    /// Record to persist, if the stored one needs replacing.
    pub write: Option<CycleRecord>,
    /// Phase transition to announce, if any.
    pub change: Option<PhaseChange>,
}

/// Fixed-length cyclic phase clock.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleClock {
    lengths_ms: [i64; 4],
    multipliers: PhaseMultiplierTable,
    demo_multiplier: f64,
}

impl CycleClock {
    /// Build a clock from configuration.
    ///
    /// `demo_multiplier` scales every phase multiplier uniformly; pass `1.0`
    /// outside demo mode.
    pub fn new(config: &CycleConfig, demo_multiplier: f64) -> Result<Self, ClockError> {
        let minutes = [
            config.dawn_minutes,
            config.day_minutes,
            config.dusk_minutes,
            config.night_minutes,
        ];
        if minutes.contains(&0) {
            return Err(ClockError::InvalidConfig {
                reason: "every phase must last at least one minute".to_owned(),
            });
        }
        if !demo_multiplier.is_finite() || demo_multiplier <= 0.0 {
            return Err(ClockError::InvalidConfig {
                reason: format!("demo multiplier must be positive, got {demo_multiplier}"),
            });
        }
        Ok(Self {
            lengths_ms: minutes.map(|m| i64::from(m).saturating_mul(60_000)),
            multipliers: config.multipliers,
            demo_multiplier,
        })
    }

    /// Total cycle length.
    pub fn cycle_length(&self) -> Duration {
        Duration::milliseconds(self.lengths_ms.iter().sum())
    }

    /// Length of one phase.
    pub fn phase_length(&self, phase: Phase) -> Duration {
        Duration::milliseconds(self.length_ms(phase))
    }

    fn length_ms(&self, phase: Phase) -> i64 {
        let [dawn, day, dusk, night] = self.lengths_ms;
        match phase {
            Phase::Dawn => dawn,
            Phase::Day => day,
            Phase::Dusk => dusk,
            Phase::Night => night,
        }
    }

    /// Multipliers for a phase with demo scaling applied.
    pub fn multipliers(&self, phase: Phase) -> PhaseMultipliers {
        self.multipliers.get(phase).scaled(self.demo_multiplier)
    }

    /// Where the cycle is at `now` given its start.
    pub fn view_at(&self, cycle_started_at: DateTime<Utc>, now: DateTime<Utc>) -> PhaseView {
        let cycle_ms: i64 = self.lengths_ms.iter().sum();
        let elapsed_ms = (now - cycle_started_at).num_milliseconds().rem_euclid(cycle_ms.max(1));

        let mut offset = elapsed_ms;
        let mut phase = Phase::Dawn;
        for candidate in Phase::ALL {
            let len = self.length_ms(candidate);
            phase = candidate;
            if offset < len {
                break;
            }
            offset -= len;
        }

        let len = self.length_ms(phase);
        PhaseView {
            phase,
            next_phase: phase.next(),
            elapsed: Duration::milliseconds(offset),
            remaining: Duration::milliseconds(len - offset),
            progress: offset as f64 / len as f64,
            phase_started_at: now - Duration::milliseconds(offset),
            multipliers: self.multipliers(phase),
        }
    }

    /// Compare the stored record against `now` and decide what to write
    /// and announce.
    ///
    /// A missing record or one without a cycle start anchors a new cycle
    /// at `now`.
    pub fn reconcile(&self, stored: Option<&serde_json::Value>, now: DateTime<Utc>) -> Reconciled {
        let parsed: StoredRecord = stored
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let stored_phase = parsed.phase.as_deref().and_then(|p| p.parse::<Phase>().ok());
        let cycle_started_at = parsed.cycle_started_at.unwrap_or(now);
        let view = self.view_at(cycle_started_at, now);

        let record = CycleRecord {
            phase: view.phase,
            phase_started_at: view.phase_started_at,
            cycle_started_at,
        };

        let well_formed = stored_phase.is_some() && parsed.phase_started_at.is_some() && parsed.cycle_started_at.is_some();
        let phase_changed = stored_phase != Some(view.phase);
        let drifted = parsed
            .phase_started_at
            .is_some_and(|at| (at - view.phase_started_at).num_milliseconds().abs() > DRIFT_TOLERANCE_MS);

        let write = (!well_formed || phase_changed || drifted).then_some(record);
        let change = phase_changed.then_some(PhaseChange {
            from: stored_phase,
            to: view.phase,
            phase_started_at: view.phase_started_at,
        });

        Reconciled { view, write, change }
    }
}
