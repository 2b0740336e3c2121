//! Resource pipeline driver with soft-dependency handling.
//!
//! Transfer storage may not be provisioned (a fresh database, a partial
//! migration). When it is missing, generation and settlement become no-ops
//! and the rest of the tick carries on. The pipeline remembers what it
//! learned in [`TransferAvailability`] so it probes at most once per
//! cooldown and logs at most once per cooldown.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use rustbelt_types::TickDelta;

use crate::backend::{BackendError, StepContext, WorldBackend};

/// What the pipeline knows about transfer storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferAvailability {
    /// Not probed yet.
    #[default]
    Unknown,
    /// Probed and present.
    Available,
    /// Missing; do not probe again before the instant.
    UnavailableUntil(DateTime<Utc>),
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    /// Transfers enqueued.
    pub enqueued: u64,
    /// Pool deltas from settlement.
    pub delta: TickDelta,
    /// Whether the pipeline was skipped for missing storage.
    pub skipped: bool,
}

/// Generation + settlement, guarded by the availability state machine.
#[derive(Debug, Clone)]
pub struct ResourcePipeline {
    availability: TransferAvailability,
    cooldown: Duration,
}

impl ResourcePipeline {
    /// A pipeline that re-probes missing storage after `cooldown`.
    pub const fn new(cooldown: Duration) -> Self {
        Self {
            availability: TransferAvailability::Unknown,
            cooldown,
        }
    }

    /// Current availability state.
    pub const fn availability(&self) -> TransferAvailability {
        self.availability
    }

    /// Forget what was learned; the next run probes again.
    pub fn reset(&mut self) {
        self.availability = TransferAvailability::Unknown;
    }

    fn mark_unavailable(&mut self, now: DateTime<Utc>, reason: &str) {
        let until = now + self.cooldown;
        warn!(
            retry_after = %until,
            reason,
            "resource transfer storage unavailable, pipeline disabled until cooldown ends"
        );
        self.availability = TransferAvailability::UnavailableUntil(until);
    }

    /// Whether storage can be used now, probing if the state is stale.
    async fn ready<B: WorldBackend>(&mut self, backend: &B, now: DateTime<Utc>) -> Result<bool, BackendError> {
        match self.availability {
            TransferAvailability::Available => return Ok(true),
            TransferAvailability::UnavailableUntil(until) if now < until => return Ok(false),
            TransferAvailability::Unknown | TransferAvailability::UnavailableUntil(_) => {}
        }
        if backend.transfer_storage_available().await? {
            if self.availability != TransferAvailability::Unknown {
                info!("resource transfer storage is available again");
            }
            self.availability = TransferAvailability::Available;
            Ok(true)
        } else {
            self.mark_unavailable(now, "probe found no transfer table");
            Ok(false)
        }
    }

    /// Generate transfers then settle due ones.
    ///
    /// Missing storage degrades to an empty report; every other error
    /// propagates.
    pub async fn run<B: WorldBackend>(&mut self, backend: &B, ctx: &StepContext<'_>) -> Result<PipelineReport, BackendError> {
        if !self.ready(backend, ctx.now).await? {
            return Ok(PipelineReport {
                skipped: true,
                ..PipelineReport::default()
            });
        }

        let enqueued = match backend.generate_resources(ctx).await {
            Ok(n) => n,
            Err(e) if e.is_storage_unavailable() => {
                self.mark_unavailable(ctx.now, &e.to_string());
                return Ok(PipelineReport {
                    skipped: true,
                    ..PipelineReport::default()
                });
            }
            Err(e) => return Err(e),
        };

        let delta = match backend.settle_transfers(ctx).await {
            Ok(d) => d,
            Err(e) if e.is_storage_unavailable() => {
                self.mark_unavailable(ctx.now, &e.to_string());
                return Ok(PipelineReport {
                    enqueued,
                    skipped: true,
                    ..PipelineReport::default()
                });
            }
            Err(e) => return Err(e),
        };

        debug!(enqueued, regions_credited = delta.regions.len(), "resource pipeline ran");
        Ok(PipelineReport {
            enqueued,
            delta,
            skipped: false,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::memory::MemoryWorld;
    use crate::rules::WorldRules;
    use rustbelt_types::{Phase, PhaseMultipliers};

    fn ctx(rules: &WorldRules, now: DateTime<Utc>) -> StepContext<'_> {
        StepContext {
            now,
            phase: Phase::Day,
            multipliers: PhaseMultipliers::NEUTRAL,
            rules,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn missing_storage_skips_until_cooldown() {
        let world = MemoryWorld::new();
        world.set_transfer_storage(false).await;
        let rules = WorldRules::default();
        let mut pipeline = ResourcePipeline::new(Duration::minutes(5));

        let report = pipeline.run(&world, &ctx(&rules, t0())).await.unwrap();
        assert!(report.skipped);
        assert_eq!(
            pipeline.availability(),
            TransferAvailability::UnavailableUntil(t0() + Duration::minutes(5))
        );

        // Storage appears, but the cooldown has not passed.
        world.set_transfer_storage(true).await;
        let report = pipeline.run(&world, &ctx(&rules, t0() + Duration::minutes(1))).await.unwrap();
        assert!(report.skipped);

        let report = pipeline.run(&world, &ctx(&rules, t0() + Duration::minutes(6))).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(pipeline.availability(), TransferAvailability::Available);
    }

    #[tokio::test]
    async fn reset_forces_a_new_probe() {
        let world = MemoryWorld::new();
        world.set_transfer_storage(false).await;
        let rules = WorldRules::default();
        let mut pipeline = ResourcePipeline::new(Duration::hours(1));
        let _ = pipeline.run(&world, &ctx(&rules, t0())).await.unwrap();

        world.set_transfer_storage(true).await;
        pipeline.reset();
        assert_eq!(pipeline.availability(), TransferAvailability::Unknown);
        let report = pipeline.run(&world, &ctx(&rules, t0())).await.unwrap();
        assert!(!report.skipped);
    }
}
