//! Tick orchestrator: one serialized pass over the whole world.
//!
//! A tick runs only while holding the global tick lock. If another driver
//! holds it the tick is skipped, not queued. Once the lock is held the
//! steps run in a fixed order:
//!
//! 1. **Cycle** -- reconcile the stored cycle record with wall time and
//!    announce phase changes.
//! 2. **Spread** -- one rust spread pass.
//! 3. **Decay** -- road decay under the current rust and phase.
//! 4. **Pipeline** -- resource generation and transfer settlement.
//! 5. **Spawn** -- repair tasks for degraded roads.
//! 6. **Priority** -- vote decay and priority refresh.
//! 7. **Dispatch** -- idle crews claim tasks.
//! 8. **Advance** -- arrival, completion and return transitions.
//! 9. **Cleanup** -- roster sync, orphan recovery, retention.
//!
//! The deltas of every step are merged, deduplicated and published as one
//! batch. The lock is released whether or not the steps succeeded.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use rustbelt_types::{
    Channel, CrewDelta, DeltaCounts, FeatureDelta, FeedEvent, HexDelta, Phase, RegionDelta, TaskDelta, TickDelta,
    Vote,
};
use rustbelt_world::priority;

use crate::backend::{BackendError, CleanupReport, StepContext, WorldBackend};
use crate::clock::{ClockError, CycleClock, PhaseView};
use crate::config::{ConfigError, SimulationConfig};
use crate::narrate;
use crate::notify::{NotificationSink, publish_json};
use crate::pipeline::{ResourcePipeline, TransferAvailability};
use crate::rules::WorldRules;

/// The stages of a tick, for error reporting and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStep {
    /// Acquiring the tick lock.
    Lock,
    /// Cycle clock reconciliation.
    Cycle,
    /// Rust spread.
    Spread,
    /// Road decay.
    Decay,
    /// Resource generation and settlement.
    Pipeline,
    /// Task spawning.
    Spawn,
    /// Priority refresh.
    Priority,
    /// Idle crew dispatch.
    Dispatch,
    /// Busy crew transitions.
    Advance,
    /// Cleanup.
    Cleanup,
    /// World reset.
    Reset,
}

impl TickStep {
    /// Log-friendly name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Cycle => "cycle",
            Self::Spread => "spread",
            Self::Decay => "decay",
            Self::Pipeline => "pipeline",
            Self::Spawn => "spawn",
            Self::Priority => "priority",
            Self::Dispatch => "dispatch",
            Self::Advance => "advance",
            Self::Cleanup => "cleanup",
            Self::Reset => "reset",
        }
    }
}

impl fmt::Display for TickStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end a tick.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    /// A step failed; the tick was abandoned after it.
    #[error("tick step {step} failed: {source}")]
    Step {
        /// The failing step.
        step: TickStep,
        /// The underlying backend error.
        source: BackendError,
    },

    /// The steps succeeded but the lock could not be released.
    #[error("failed to release tick lock: {source}")]
    LockRelease {
        /// The underlying backend error.
        source: BackendError,
    },

    /// A vote was rejected before reaching storage.
    #[error("invalid vote: {source}")]
    Vote {
        /// The validation error.
        #[from]
        source: rustbelt_world::WorldError,
    },

    /// The cycle configuration is unusable.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },

    /// The simulation configuration is unusable.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },
}

fn at(step: TickStep) -> impl FnOnce(BackendError) -> TickError {
    move |source| TickError::Step { step, source }
}

/// What a call to [`TickEngine::run_tick`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The lock was held elsewhere; nothing happened.
    Skipped,
    /// The tick ran to completion.
    Completed(TickSummary),
}

/// Compact record of one completed tick. Published on the `tick` channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickSummary {
    /// Ticks completed by this engine, including this one.
    pub tick: u64,
    /// Active phase.
    pub phase: Phase,
    /// Tick wall time.
    pub started_at: DateTime<Utc>,
    /// Time spent inside the lock.
    pub duration_ms: u64,
    /// Entries per delta section after deduplication.
    pub counts: DeltaCounts,
    /// Transfers created by generation.
    pub transfers_enqueued: u64,
    /// Whether the resource pipeline was skipped.
    pub pipeline_skipped: bool,
    /// Cleanup counts.
    pub cleanup: CleanupReport,
}

/// Payload of the `world_delta` channel.
#[derive(Debug, Serialize)]
struct WorldDeltaMessage<'a> {
    tick: u64,
    at: DateTime<Utc>,
    hexes: &'a [HexDelta],
    features: &'a [FeatureDelta],
    tasks: &'a [TaskDelta],
    crews: &'a [CrewDelta],
    regions: &'a [RegionDelta],
}

/// Payload of the `feed` channel.
#[derive(Debug, Serialize)]
struct FeedMessage<'a> {
    tick: u64,
    events: &'a [FeedEvent],
}

/// Drives ticks against a backend and publishes the results.
#[derive(Debug)]
pub struct TickEngine<B, S> {
    backend: B,
    sink: S,
    clock: CycleClock,
    rules: WorldRules,
    pipeline: ResourcePipeline,
    tick_count: u64,
}

impl<B: WorldBackend, S: NotificationSink> TickEngine<B, S> {
    /// Assemble an engine from parts.
    pub const fn new(backend: B, sink: S, clock: CycleClock, rules: WorldRules, pipeline_cooldown: Duration) -> Self {
        Self {
            backend,
            sink,
            clock,
            rules,
            pipeline: ResourcePipeline::new(pipeline_cooldown),
            tick_count: 0,
        }
    }

    /// Build an engine from loaded configuration.
    pub fn from_config(backend: B, sink: S, config: &SimulationConfig) -> Result<Self, TickError> {
        let clock = CycleClock::new(&config.cycle, config.demo_multiplier())?;
        let rules = config.rules()?;
        let cooldown_secs = i64::try_from(config.pipeline.unavailable_cooldown_secs).unwrap_or(i64::MAX);
        let cooldown = Duration::try_seconds(cooldown_secs).unwrap_or(Duration::MAX);
        Ok(Self::new(backend, sink, clock, rules, cooldown))
    }

    /// The backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The notification sink.
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// The rules in effect.
    pub const fn rules(&self) -> &WorldRules {
        &self.rules
    }

    /// Ticks completed so far.
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// What the pipeline currently believes about transfer storage.
    pub const fn transfer_availability(&self) -> TransferAvailability {
        self.pipeline.availability()
    }

    /// The phase at `now` according to the stored record, without writing.
    pub async fn current_phase(&self, now: DateTime<Utc>) -> Result<PhaseView, TickError> {
        let stored = self.backend.load_cycle_record().await.map_err(at(TickStep::Cycle))?;
        Ok(self.clock.reconcile(stored.as_ref(), now).view)
    }

    /// Attempt one tick at wall time `now`.
    pub async fn run_tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome, TickError> {
        if !self.backend.try_acquire_tick_lock().await.map_err(at(TickStep::Lock))? {
            info!("tick lock held by another driver, skipping tick");
            return Ok(TickOutcome::Skipped);
        }

        let result = self.run_locked(now).await;
        let released = self.backend.release_tick_lock().await;

        match (result, released) {
            (Ok(summary), Ok(())) => Ok(TickOutcome::Completed(summary)),
            (Ok(_), Err(source)) => Err(TickError::LockRelease { source }),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                error!(error = %release, "failed to release tick lock after failed tick");
                Err(e)
            }
        }
    }

    async fn run_locked(&mut self, now: DateTime<Utc>) -> Result<TickSummary, TickError> {
        let started = Instant::now();
        let tick = self.tick_count.saturating_add(1);

        // --- Cycle ---
        let stored = self.backend.load_cycle_record().await.map_err(at(TickStep::Cycle))?;
        let reconciled = self.clock.reconcile(stored.as_ref(), now);
        if let Some(record) = &reconciled.write {
            self.backend.store_cycle_record(record).await.map_err(at(TickStep::Cycle))?;
        }
        let view = reconciled.view;
        info!(tick, phase = %view.phase, progress = view.progress, "tick started");

        let mut delta = TickDelta::default();
        if let Some(change) = &reconciled.change {
            info!(from = ?change.from, to = %change.to, "phase changed");
            if let Err(e) = publish_json(&self.sink, Channel::Phase, change).await {
                warn!(error = %e, "failed to publish phase change");
            }
            delta.feed.push(narrate::phase_began(change, now));
        }

        let ctx = StepContext {
            now,
            phase: view.phase,
            multipliers: view.multipliers,
            rules: &self.rules,
        };

        // --- World ---
        delta.merge(self.backend.spread_rust(&ctx).await.map_err(at(TickStep::Spread))?);
        delta.merge(self.backend.decay_roads(&ctx).await.map_err(at(TickStep::Decay))?);

        let pipeline = self
            .pipeline
            .run(&self.backend, &ctx)
            .await
            .map_err(at(TickStep::Pipeline))?;
        delta.merge(pipeline.delta);

        // --- Tasks ---
        delta.merge(self.backend.spawn_tasks(&ctx).await.map_err(at(TickStep::Spawn))?);
        delta.merge(self.backend.refresh_priorities(&ctx).await.map_err(at(TickStep::Priority))?);

        // --- Crews ---
        delta.merge(self.backend.dispatch_idle_crews(&ctx).await.map_err(at(TickStep::Dispatch))?);
        delta.merge(self.backend.advance_crews(&ctx).await.map_err(at(TickStep::Advance))?);

        let cleanup = self.backend.cleanup(&ctx).await.map_err(at(TickStep::Cleanup))?;
        debug!(tick, ?cleanup, "cleanup finished");

        // --- Publish ---
        let delta = delta.deduplicated();
        if !delta.feed.is_empty() {
            if let Err(e) = self.backend.record_feed(&delta).await {
                warn!(tick, error = %e, "failed to persist feed events");
            }
        }
        self.publish(tick, now, &delta).await;

        self.tick_count = tick;
        let summary = TickSummary {
            tick,
            phase: view.phase,
            started_at: now,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            counts: delta.counts(),
            transfers_enqueued: pipeline.enqueued,
            pipeline_skipped: pipeline.skipped,
            cleanup,
        };
        if let Err(e) = publish_json(&self.sink, Channel::Tick, &summary).await {
            warn!(tick, error = %e, "failed to publish tick summary");
        }

        info!(
            tick,
            duration_ms = summary.duration_ms,
            hexes = summary.counts.hexes,
            features = summary.counts.features,
            tasks = summary.counts.tasks,
            crews = summary.counts.crews,
            feed = summary.counts.feed,
            "tick finished"
        );
        Ok(summary)
    }

    async fn publish(&self, tick: u64, now: DateTime<Utc>, delta: &TickDelta) {
        if delta.has_world_changes() {
            let message = WorldDeltaMessage {
                tick,
                at: now,
                hexes: &delta.hexes,
                features: &delta.features,
                tasks: &delta.tasks,
                crews: &delta.crews,
                regions: &delta.regions,
            };
            if let Err(e) = publish_json(&self.sink, Channel::WorldDelta, &message).await {
                warn!(tick, error = %e, "failed to publish world delta");
            }
        }
        if !delta.feed.is_empty() {
            let message = FeedMessage {
                tick,
                events: &delta.feed,
            };
            if let Err(e) = publish_json(&self.sink, Channel::Feed, &message).await {
                warn!(tick, error = %e, "failed to publish feed");
            }
        }
    }

    /// Record a vote after checking its weight.
    pub async fn cast_vote(&self, vote: &Vote) -> Result<(), TickError> {
        priority::validate_vote_weight(vote.weight)?;
        self.backend.cast_vote(vote).await.map_err(at(TickStep::Priority))
    }

    /// Restore the world to its starting state under the tick lock.
    ///
    /// Returns `false` if the lock was held elsewhere.
    pub async fn reset_world(&mut self, now: DateTime<Utc>) -> Result<bool, TickError> {
        if !self.backend.try_acquire_tick_lock().await.map_err(at(TickStep::Lock))? {
            return Ok(false);
        }
        let stored = self.backend.load_cycle_record().await;
        let view = stored.map(|s| self.clock.reconcile(s.as_ref(), now).view);
        let result = match view {
            Ok(view) => {
                let ctx = StepContext {
                    now,
                    phase: view.phase,
                    multipliers: view.multipliers,
                    rules: &self.rules,
                };
                self.backend.reset_world(&ctx).await.map_err(at(TickStep::Reset))
            }
            Err(source) => Err(TickError::Step {
                step: TickStep::Cycle,
                source,
            }),
        };
        let released = self.backend.release_tick_lock().await;
        result?;
        released.map_err(|source| TickError::LockRelease { source })?;

        self.pipeline.reset();
        info!(at = %now, "world reset");
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use serde_json::Value;

    use rustbelt_types::{CrewState, FeatureKind, FeatureStatus, FeedKind, ResourceAmounts, TaskId, TaskStatus, VoterId};

    use super::*;
    use crate::clock::CycleRecord;
    use crate::config::CycleConfig;
    use crate::memory::{MemoryState, MemoryWorld, demo_state};
    use crate::notify::RecordingSink;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn engine(state: MemoryState) -> TickEngine<MemoryWorld, RecordingSink> {
        let clock = CycleClock::new(&CycleConfig::default(), 1.0).unwrap();
        TickEngine::new(
            MemoryWorld::with_state(state),
            RecordingSink::new(),
            clock,
            WorldRules::default(),
            Duration::minutes(5),
        )
    }

    /// Demo world with one residential road knocked down to health 50.
    fn degraded_world(pool: i64) -> MemoryState {
        let mut state = demo_state(t0(), pool);
        let road = state
            .features
            .values()
            .find(|f| f.road_class == Some(rustbelt_types::RoadClass::Residential))
            .map(|f| f.id)
            .unwrap();
        if let Some(fs) = state.feature_states.get_mut(&road) {
            fs.health = 50.0;
            fs.status = FeatureStatus::Degraded;
        }
        state
    }

    fn completed(outcome: TickOutcome) -> TickSummary {
        match outcome {
            TickOutcome::Completed(summary) => Some(summary),
            TickOutcome::Skipped => None,
        }
        .unwrap()
    }

    #[tokio::test]
    async fn first_tick_anchors_cycle_and_announces_phase() {
        let mut engine = engine(demo_state(t0(), 100));
        let summary = completed(engine.run_tick(t0()).await.unwrap());
        assert_eq!(summary.tick, 1);
        assert_eq!(summary.phase, Phase::Dawn);

        let phase = engine.sink().on(Channel::Phase);
        assert_eq!(phase.len(), 1);
        assert_eq!(phase.first().and_then(|p| p.get("from")), Some(&Value::Null));
        assert_eq!(engine.sink().on(Channel::Tick).len(), 1);

        let stored = engine.backend().load_cycle_record().await.unwrap().unwrap();
        let record: CycleRecord = serde_json::from_value(stored).unwrap();
        assert_eq!(record.cycle_started_at, t0());
        assert_eq!(record.phase, Phase::Dawn);

        let s = engine.backend().snapshot().await;
        assert!(s.feed.iter().any(|e| e.kind == FeedKind::PhaseChanged));
    }

    #[tokio::test]
    async fn phase_change_announced_once() {
        let mut engine = engine(demo_state(t0(), 100));
        let _ = engine.run_tick(t0()).await.unwrap();
        let _ = engine.run_tick(t0() + Duration::seconds(30)).await.unwrap();
        let _ = engine.run_tick(t0() + Duration::minutes(3)).await.unwrap();

        let phase = engine.sink().on(Channel::Phase);
        assert_eq!(phase.len(), 2);
        let last = phase.last().unwrap();
        assert_eq!(last.get("from"), Some(&Value::from("dawn")));
        assert_eq!(last.get("to"), Some(&Value::from("day")));
    }

    #[tokio::test]
    async fn tick_dispatches_crew_to_degraded_road() {
        let mut engine = engine(degraded_world(100));
        let summary = completed(engine.run_tick(t0()).await.unwrap());
        assert_eq!(summary.counts.crews, 1);

        let s = engine.backend().snapshot().await;
        let task = s.tasks.values().next().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        let pools = s.regions.values().next().unwrap().pools;
        assert_eq!(pools, ResourceAmounts::uniform(90));
        let crew = s.crews.values().next().unwrap();
        assert_eq!(crew.state.active_task(), Some(task.id));

        let deltas = engine.sink().on(Channel::WorldDelta);
        assert_eq!(deltas.len(), 1);
        let feed = engine.sink().on(Channel::Feed);
        let kinds: Vec<String> = feed
            .iter()
            .filter_map(|m| m.get("events").and_then(Value::as_array))
            .flatten()
            .filter_map(|e| e.get("kind").and_then(Value::as_str).map(str::to_owned))
            .collect();
        assert!(kinds.iter().any(|k| k == "task_spawned"));
        assert!(kinds.iter().any(|k| k == "crew_dispatched"));
    }

    #[tokio::test]
    async fn pools_never_negative_and_crews_stay_consistent() {
        let mut state = demo_state(t0(), 25);
        for fs in state.feature_states.values_mut() {
            fs.health = 40.0;
            fs.status = FeatureStatus::Degraded;
        }
        let mut engine = engine(state);

        for i in 0..80 {
            let now = t0() + Duration::seconds(i * 45);
            let _ = completed(engine.run_tick(now).await.unwrap());
            let s = engine.backend().snapshot().await;
            for region in s.regions.values() {
                assert!(region.pools.iter().all(|(_, v)| v >= 0), "negative pool at tick {i}");
            }
            for crew in s.crews.values() {
                match crew.state {
                    CrewState::Traveling { task_id, .. } | CrewState::Working { task_id, .. } => {
                        let task = s.tasks.get(&task_id).unwrap();
                        assert_eq!(task.status, TaskStatus::Active);
                    }
                    CrewState::Idle | CrewState::Returning { .. } => {}
                }
            }
            let active = s.tasks.values().filter(|t| t.status == TaskStatus::Active).count();
            let busy = s.crews.values().filter(|c| c.state.active_task().is_some()).count();
            assert_eq!(active, busy);
        }

        let s = engine.backend().snapshot().await;
        assert!(s.tasks.values().any(|t| t.status == TaskStatus::Done));
    }

    #[tokio::test]
    async fn held_lock_skips_without_side_effects() {
        let mut engine = engine(degraded_world(100));
        assert!(engine.backend().try_acquire_tick_lock().await.unwrap());

        let outcome = engine.run_tick(t0()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);
        assert!(engine.sink().messages().is_empty());
        assert!(engine.backend().snapshot().await.tasks.is_empty());
        assert_eq!(engine.tick_count(), 0);
        assert!(engine.backend().tick_lock_held());
    }

    #[tokio::test]
    async fn lock_released_after_each_tick() {
        let mut engine = engine(demo_state(t0(), 100));
        let _ = engine.run_tick(t0()).await.unwrap();
        assert!(!engine.backend().tick_lock_held());
    }

    #[tokio::test]
    async fn missing_transfer_storage_does_not_fail_tick() {
        let state = MemoryState {
            transfer_storage: false,
            ..demo_state(t0(), 100)
        };
        let mut engine = engine(state);
        let summary = completed(engine.run_tick(t0()).await.unwrap());
        assert!(summary.pipeline_skipped);
        assert!(matches!(
            engine.transfer_availability(),
            TransferAvailability::UnavailableUntil(_)
        ));
    }

    #[tokio::test]
    async fn generated_supplies_arrive_on_later_tick() {
        let mut engine = engine(demo_state(t0(), 0));
        let first = completed(engine.run_tick(t0()).await.unwrap());
        assert!(first.transfers_enqueued > 0);
        let _ = engine.run_tick(t0() + Duration::minutes(11)).await.unwrap();

        let s = engine.backend().snapshot().await;
        let pools = s.regions.values().next().unwrap().pools;
        assert!(!pools.is_zero());
        assert!(s.feed.iter().any(|e| e.kind == FeedKind::ResourcesDelivered));
    }

    #[tokio::test]
    async fn zero_weight_vote_rejected() {
        let engine = engine(demo_state(t0(), 100));
        let vote = Vote {
            task_id: TaskId::new(),
            voter_id: VoterId::new(),
            weight: 0.0,
            created_at: t0(),
        };
        assert!(matches!(engine.cast_vote(&vote).await, Err(TickError::Vote { .. })));
    }

    #[tokio::test]
    async fn reset_restores_world_and_reprobes_storage() {
        let state = MemoryState {
            transfer_storage: false,
            ..degraded_world(100)
        };
        let mut engine = engine(state);
        let _ = engine.run_tick(t0()).await.unwrap();
        assert!(!engine.backend().snapshot().await.tasks.is_empty());

        assert!(engine.reset_world(t0() + Duration::seconds(10)).await.unwrap());
        assert_eq!(engine.transfer_availability(), TransferAvailability::Unknown);
        assert!(!engine.backend().tick_lock_held());

        let s = engine.backend().snapshot().await;
        assert!(s.tasks.is_empty());
        assert!(s.feed.is_empty());
        assert!(
            s.features
                .values()
                .filter(|f| f.kind == FeatureKind::Road)
                .all(|f| s.feature_states.get(&f.id).map(|fs| fs.status) == Some(FeatureStatus::Normal))
        );
        assert!(s.crews.values().all(|c| c.state == CrewState::Idle));
    }
}
