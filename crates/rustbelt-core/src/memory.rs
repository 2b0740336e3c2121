//! In-memory [`WorldBackend`].
//!
//! Holds the whole world in ordered maps behind one async mutex. Each step
//! takes the mutex once, so steps are atomic with respect to each other,
//! which is the same guarantee the Postgres backend gets from per-step
//! transactions. The rules are the ones in [`rustbelt_world`]; only the
//! storage differs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use rustbelt_types::{
    Crew, CrewDelta, CrewId, CrewState, Feature, FeatureDelta, FeatureId, FeatureKind, FeatureState,
    FeatureStatus, FeedEvent, GeoPoint, HexCell, HexDelta, HexId, Region, RegionDelta, RegionId,
    ResourceAmounts, ResourceTransfer, Task, TaskDelta, TaskId, TaskStatus, TickDelta, TransferId,
    TransferStatus, Vote, VoterId,
};
use rustbelt_world::decay::{average_rust, decay_magnitude, decay_road, status_for_health};
use rustbelt_world::spread::{apply_pushback, spread_rust, tally_road_termini};
use rustbelt_world::{
    AxialGrid, GraphProvider, RoadGraph, TaskCandidate, crew, estimate_travel, generation, priority, select_task,
};

use crate::backend::{
    BackendError, CYCLE_KEY, CleanupReport, LAST_RESET_KEY, PRIORITY_EPSILON, StepContext, WorldBackend,
};
use crate::clock::CycleRecord;
use crate::narrate;

/// Everything a [`MemoryWorld`] stores.
#[derive(Debug, Clone)]
pub struct MemoryState {
    /// Regions by ID.
    pub regions: BTreeMap<RegionId, Region>,
    /// Hex cells by ID.
    pub hexes: BTreeMap<HexId, HexCell>,
    /// Rust levels restored by a reset for non-center cells.
    pub baseline_rust: BTreeMap<HexId, f64>,
    /// Static features by ID.
    pub features: BTreeMap<FeatureId, Feature>,
    /// Mutable feature state by feature ID.
    pub feature_states: BTreeMap<FeatureId, FeatureState>,
    /// Tasks by ID.
    pub tasks: BTreeMap<TaskId, Task>,
    /// Votes keyed by (task, voter).
    pub votes: BTreeMap<(TaskId, VoterId), Vote>,
    /// Crews by ID.
    pub crews: BTreeMap<CrewId, Crew>,
    /// Transfers by ID.
    pub transfers: BTreeMap<TransferId, ResourceTransfer>,
    /// Persisted feed, oldest first.
    pub feed: Vec<FeedEvent>,
    /// World metadata blobs.
    pub meta: BTreeMap<String, serde_json::Value>,
    /// Routing graphs per region.
    pub graphs: BTreeMap<RegionId, RoadGraph>,
    /// Whether transfer storage exists.
    pub transfer_storage: bool,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            regions: BTreeMap::new(),
            hexes: BTreeMap::new(),
            baseline_rust: BTreeMap::new(),
            features: BTreeMap::new(),
            feature_states: BTreeMap::new(),
            tasks: BTreeMap::new(),
            votes: BTreeMap::new(),
            crews: BTreeMap::new(),
            transfers: BTreeMap::new(),
            feed: Vec::new(),
            meta: BTreeMap::new(),
            graphs: BTreeMap::new(),
            transfer_storage: true,
        }
    }
}

impl MemoryState {
    /// Add a region.
    pub fn add_region(&mut self, region: Region) {
        self.regions.insert(region.id, region);
    }

    /// Add a hex cell; its current level becomes the reset baseline.
    pub fn add_hex(&mut self, cell: HexCell) {
        self.baseline_rust.insert(cell.id, cell.rust_level);
        self.hexes.insert(cell.id, cell);
    }

    /// Add a feature with its starting state.
    pub fn add_feature(&mut self, feature: Feature, state: FeatureState) {
        self.feature_states.insert(feature.id, state);
        self.features.insert(feature.id, feature);
    }

    /// Add an idle crew at its region's hub. Returns its ID, or `None` if
    /// the region is unknown.
    pub fn add_idle_crew(&mut self, region_id: RegionId) -> Option<CrewId> {
        let hub = self.regions.get(&region_id)?.hub;
        let id = CrewId::new();
        self.crews.insert(
            id,
            Crew {
                id,
                region_id,
                state: CrewState::Idle,
                position: hub,
            },
        );
        Some(id)
    }

    fn open_task_for(&self, feature_id: FeatureId) -> Option<&Task> {
        self.tasks
            .values()
            .find(|t| t.feature_id == feature_id && !t.status.is_terminal())
    }

    fn candidates_in(&self, region_id: RegionId, ctx: &StepContext<'_>) -> Vec<TaskCandidate> {
        self.tasks
            .values()
            .filter(|t| t.region_id == region_id && t.status == TaskStatus::Queued)
            .filter_map(|t| {
                let feature = self.features.get(&t.feature_id)?;
                let state = self.feature_states.get(&t.feature_id)?;
                Some(TaskCandidate {
                    task_id: t.id,
                    feature_id: t.feature_id,
                    position: feature.position,
                    costs: t.costs,
                    class_weight: ctx.rules.road_classes.get_or_default(feature.road_class).priority_weight,
                    health: state.health,
                })
            })
            .collect()
    }

    /// Claim the best affordable task for a crew at `from`: debit the
    /// pools and activate the task. Returns the task and its site.
    fn claim_task(
        &mut self,
        region_id: RegionId,
        from: GeoPoint,
        ctx: &StepContext<'_>,
        delta: &mut TickDelta,
    ) -> Option<(TaskId, GeoPoint)> {
        let candidates = self.candidates_in(region_id, ctx);
        let region = self.regions.get_mut(&region_id)?;
        let chosen = *select_task(&candidates, from, &region.pools)?;
        let debited = region.pools.checked_debit(&chosen.costs)?;
        region.pools = debited;
        delta.regions.push(RegionDelta {
            region_id,
            pools: debited,
        });

        let task = self.tasks.get_mut(&chosen.task_id)?;
        task.status = TaskStatus::Active;
        delta.tasks.push(task_delta(task));
        Some((chosen.task_id, chosen.position))
    }

    fn hub_of(&self, region_id: RegionId) -> Option<GeoPoint> {
        self.regions.get(&region_id).map(|r| r.hub)
    }

    fn travel_secs(&self, region_id: RegionId, from: GeoPoint, to: GeoPoint, ctx: &StepContext<'_>) -> i64 {
        estimate_travel(self.graphs.graph_for(region_id), from, to, ctx.now, &ctx.rules.travel).travel_secs
    }
}

fn task_delta(task: &Task) -> TaskDelta {
    TaskDelta {
        task_id: task.id,
        feature_id: task.feature_id,
        status: task.status,
        priority_score: task.priority_score,
    }
}

fn crew_delta(crew: &Crew) -> CrewDelta {
    CrewDelta {
        crew_id: crew.id,
        status: crew.state.status(),
        active_task_id: crew.state.active_task(),
        position: crew.position,
        busy_until: crew.state.busy_until(),
    }
}

/// An in-memory world.
#[derive(Debug)]
pub struct MemoryWorld {
    state: Mutex<MemoryState>,
    tick_lock: AtomicBool,
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorld {
    /// An empty world with transfer storage present.
    pub fn new() -> Self {
        Self::with_state(MemoryState::default())
    }

    /// A world starting from `state`.
    pub fn with_state(state: MemoryState) -> Self {
        Self {
            state: Mutex::new(state),
            tick_lock: AtomicBool::new(false),
        }
    }

    /// A copy of the current state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// Mutate the state directly.
    pub async fn edit<R>(&self, f: impl FnOnce(&mut MemoryState) -> R + Send) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Make transfer storage appear or disappear.
    pub async fn set_transfer_storage(&self, present: bool) {
        self.state.lock().await.transfer_storage = present;
    }

    /// Whether the tick lock is currently held.
    pub fn tick_lock_held(&self) -> bool {
        self.tick_lock.load(Ordering::Acquire)
    }
}

impl WorldBackend for MemoryWorld {
    async fn try_acquire_tick_lock(&self) -> Result<bool, BackendError> {
        Ok(self
            .tick_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn release_tick_lock(&self) -> Result<(), BackendError> {
        self.tick_lock.store(false, Ordering::Release);
        Ok(())
    }

    async fn load_cycle_record(&self) -> Result<Option<serde_json::Value>, BackendError> {
        Ok(self.state.lock().await.meta.get(CYCLE_KEY).cloned())
    }

    async fn store_cycle_record(&self, record: &CycleRecord) -> Result<(), BackendError> {
        let value = serde_json::to_value(record).map_err(BackendError::storage)?;
        self.state.lock().await.meta.insert(CYCLE_KEY.to_owned(), value);
        Ok(())
    }

    async fn spread_rust(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let mut state = self.state.lock().await;
        let cells: Vec<HexCell> = state.hexes.values().copied().collect();
        let grid = AxialGrid::from_cells(&cells);
        let features: Vec<Feature> = state.features.values().cloned().collect();
        let tallies = tally_road_termini(&features, &state.feature_states, ctx.rules.spread.healthy_road_health);
        let changes = spread_rust(&cells, &grid, &tallies, &ctx.multipliers, &ctx.rules.spread);
        for change in &changes {
            if let Some(cell) = state.hexes.get_mut(&change.hex_id) {
                cell.rust_level = change.rust_level;
            }
        }
        Ok(TickDelta {
            hexes: changes,
            ..TickDelta::default()
        })
    }

    async fn decay_roads(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let rust: BTreeMap<HexId, f64> = state.hexes.values().map(|c| (c.id, c.rust_level)).collect();
        let mut delta = TickDelta::default();

        for feature in state.features.values().filter(|f| f.kind == FeatureKind::Road) {
            let Some(region) = state.regions.get(&feature.region_id) else {
                continue;
            };
            let Some(before) = state.feature_states.get(&feature.id).copied() else {
                continue;
            };
            let profile = ctx.rules.road_classes.get_or_default(feature.road_class);
            let magnitude = decay_magnitude(
                profile.decay_rate,
                average_rust(&feature.hexes, &rust),
                ctx.multipliers.decay,
                region.difficulty_multiplier,
            );
            let Some(outcome) = decay_road(before, magnitude, &ctx.rules.decay) else {
                continue;
            };
            state.feature_states.insert(feature.id, outcome.state);
            if !outcome.notable {
                continue;
            }
            delta.features.push(FeatureDelta {
                feature_id: feature.id,
                health: outcome.state.health,
                status: outcome.state.status,
            });
            delta.feed.extend(narrate::road_decayed(
                feature.id,
                feature.region_id,
                &region.name,
                before.status,
                &outcome,
                ctx.now,
            ));
        }
        Ok(delta)
    }

    async fn transfer_storage_available(&self) -> Result<bool, BackendError> {
        Ok(self.state.lock().await.transfer_storage)
    }

    async fn generate_resources(&self, ctx: &StepContext<'_>) -> Result<u64, BackendError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.transfer_storage {
            return Err(BackendError::StorageUnavailable {
                what: "resource_transfers".to_owned(),
            });
        }
        let rust: BTreeMap<HexId, f64> = state.hexes.values().map(|c| (c.id, c.rust_level)).collect();
        let mut created = Vec::new();

        for building in state.features.values().filter(|f| f.kind == FeatureKind::Building && f.generates_resources) {
            let Some(hub) = state.regions.get(&building.region_id).map(|r| r.hub) else {
                continue;
            };
            let outputs = generation::building_output(average_rust(&building.hexes, &rust), &ctx.multipliers);
            if outputs.is_empty() {
                continue;
            }
            let estimate = estimate_travel(
                state.graphs.graph_for(building.region_id),
                building.position,
                hub,
                ctx.now,
                &ctx.rules.travel,
            );
            for (category, amount) in outputs {
                created.push(ResourceTransfer {
                    id: TransferId::new(),
                    region_id: building.region_id,
                    source_feature_id: building.id,
                    category,
                    amount,
                    departed_at: ctx.now,
                    arrives_at: estimate.arrival(ctx.now),
                    status: TransferStatus::InTransit,
                    waypoints: estimate.waypoints.clone(),
                });
            }
        }

        let count = u64::try_from(created.len()).unwrap_or(u64::MAX);
        for transfer in created {
            state.transfers.insert(transfer.id, transfer);
        }
        Ok(count)
    }

    async fn settle_transfers(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.transfer_storage {
            return Err(BackendError::StorageUnavailable {
                what: "resource_transfers".to_owned(),
            });
        }

        let mut sums: BTreeMap<RegionId, ResourceAmounts> = BTreeMap::new();
        for transfer in state
            .transfers
            .values_mut()
            .filter(|t| t.status == TransferStatus::InTransit && t.arrives_at <= ctx.now)
        {
            transfer.status = TransferStatus::Arrived;
            let sum = sums.entry(transfer.region_id).or_default();
            let slot = sum.get_mut(transfer.category);
            *slot = slot.saturating_add(transfer.amount);
        }

        let mut delta = TickDelta::default();
        for (region_id, credit) in sums {
            let Some(region) = state.regions.get_mut(&region_id) else {
                continue;
            };
            region.pools = region.pools.saturating_credit(&credit);
            delta.regions.push(RegionDelta {
                region_id,
                pools: region.pools,
            });
            let total: i64 = credit.iter().map(|(_, v)| v).sum();
            delta
                .feed
                .push(narrate::resources_delivered(region_id, &region.name, total, ctx.now));
        }
        Ok(delta)
    }

    async fn spawn_tasks(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut delta = TickDelta::default();

        let degraded: Vec<(Feature, FeatureState)> = state
            .features
            .values()
            .filter(|f| f.kind == FeatureKind::Road)
            .filter_map(|f| state.feature_states.get(&f.id).map(|s| (f.clone(), *s)))
            .filter(|(_, s)| s.health < ctx.rules.decay.degraded_threshold && s.status != FeatureStatus::Repairing)
            .collect();

        for (feature, feature_state) in degraded {
            if state.open_task_for(feature.id).is_some() {
                continue;
            }
            let profile = ctx.rules.road_classes.get_or_default(feature.road_class);
            let task = Task {
                id: TaskId::new(),
                feature_id: feature.id,
                region_id: feature.region_id,
                status: TaskStatus::Queued,
                costs: profile.costs,
                duration_secs: profile.duration_secs,
                repair_amount: profile.repair_amount,
                priority_score: priority::baseline_priority(feature_state.health, profile.priority_weight),
                vote_score: 0.0,
                created_at: ctx.now,
                completed_at: None,
            };
            delta.tasks.push(task_delta(&task));
            delta
                .feed
                .push(narrate::task_spawned(task.id, task.region_id, feature_state.health, ctx.now));
            state.tasks.insert(task.id, task);
        }
        Ok(delta)
    }

    async fn refresh_priorities(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut delta = TickDelta::default();

        for task in state.tasks.values_mut().filter(|t| !t.status.is_terminal()) {
            let (Some(feature), Some(feature_state)) =
                (state.features.get(&task.feature_id), state.feature_states.get(&task.feature_id))
            else {
                continue;
            };
            let weight = ctx.rules.road_classes.get_or_default(feature.road_class).priority_weight;
            let votes = state
                .votes
                .values()
                .filter(|v| v.task_id == task.id)
                .map(|v| (v.weight, v.created_at));
            let vote_score = ctx.rules.vote_decay.score(votes, ctx.now);
            let priority_score = priority::priority_score(feature_state.health, weight, vote_score);
            let changed = (priority_score - task.priority_score).abs() > PRIORITY_EPSILON;
            task.vote_score = vote_score;
            task.priority_score = priority_score;
            if changed {
                delta.tasks.push(task_delta(task));
            }
        }
        Ok(delta)
    }

    async fn dispatch_idle_crews(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut delta = TickDelta::default();

        let idle: Vec<Crew> = state
            .crews
            .values()
            .filter(|c| c.state == CrewState::Idle)
            .copied()
            .collect();

        for crew in idle {
            let Some((task_id, site)) = state.claim_task(crew.region_id, crew.position, ctx, &mut delta) else {
                continue;
            };
            let travel = state.travel_secs(crew.region_id, crew.position, site, ctx);
            let Some(entry) = state.crews.get_mut(&crew.id) else {
                continue;
            };
            entry.state = CrewState::Traveling {
                task_id,
                busy_until: ctx.now + Duration::seconds(travel),
                destination: site,
            };
            delta.crews.push(crew_delta(entry));
            delta
                .feed
                .push(narrate::crew_dispatched(crew.id, crew.region_id, travel, false, ctx.now));
            debug!(crew_id = %crew.id, task_id = %task_id, travel_secs = travel, "crew dispatched");
        }
        Ok(delta)
    }

    async fn advance_crews(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut delta = TickDelta::default();

        let due: Vec<Crew> = state
            .crews
            .values()
            .filter(|c| c.state.busy_until().is_some_and(|t| t <= ctx.now))
            .copied()
            .collect();

        for crew in due {
            match crew.state {
                CrewState::Traveling {
                    task_id, destination, ..
                } => arrive_on_site(state, crew, task_id, destination, ctx, &mut delta),
                CrewState::Working { task_id, .. } => finish_repair(state, crew, task_id, ctx, &mut delta),
                CrewState::Returning { .. } => {
                    let Some(hub) = state.hub_of(crew.region_id) else {
                        continue;
                    };
                    if let Some(entry) = state.crews.get_mut(&crew.id) {
                        entry.state = CrewState::Idle;
                        entry.position = hub;
                        delta.crews.push(crew_delta(entry));
                    }
                    delta.feed.push(narrate::crew_returned(crew.id, crew.region_id, ctx.now));
                }
                CrewState::Idle => {}
            }
        }
        Ok(delta)
    }

    async fn cleanup(&self, ctx: &StepContext<'_>) -> Result<CleanupReport, BackendError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut report = CleanupReport::default();

        sync_crews(state, ctx, &mut report);
        recover_orphans(state, ctx, &mut report);

        let retention = &ctx.rules.retention;
        let feed_cutoff = retention.feed_cutoff(ctx.now);
        let before = state.feed.len();
        state.feed.retain(|e| e.occurred_at >= feed_cutoff);
        report.feed_deleted = u64::try_from(before.saturating_sub(state.feed.len())).unwrap_or(0);

        let transfer_cutoff = retention.transfer_cutoff(ctx.now);
        let before = state.transfers.len();
        state
            .transfers
            .retain(|_, t| !(t.status == TransferStatus::Arrived && t.arrives_at < transfer_cutoff));
        report.transfers_deleted = u64::try_from(before.saturating_sub(state.transfers.len())).unwrap_or(0);

        let task_cutoff = retention.task_cutoff(ctx.now);
        let expired: BTreeSet<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Done && t.completed_at.is_some_and(|at| at < task_cutoff))
            .map(|t| t.id)
            .collect();
        state.tasks.retain(|id, _| !expired.contains(id));
        state.votes.retain(|(task_id, _), _| !expired.contains(task_id));
        report.tasks_deleted = u64::try_from(expired.len()).unwrap_or(0);

        Ok(report)
    }

    async fn record_feed(&self, delta: &TickDelta) -> Result<(), BackendError> {
        self.state.lock().await.feed.extend(delta.feed.iter().cloned());
        Ok(())
    }

    async fn cast_vote(&self, vote: &Vote) -> Result<(), BackendError> {
        if priority::validate_vote_weight(vote.weight).is_err() {
            return Err(BackendError::InvalidVote {
                voter: vote.voter_id,
                weight: vote.weight,
            });
        }
        let mut state = self.state.lock().await;
        let votable = state.tasks.get(&vote.task_id).is_some_and(|t| !t.status.is_terminal());
        if !votable {
            return Err(BackendError::TaskNotVotable(vote.task_id));
        }
        state.votes.insert((vote.task_id, vote.voter_id), *vote);
        Ok(())
    }

    async fn reset_world(&self, ctx: &StepContext<'_>) -> Result<(), BackendError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        for feature_state in state.feature_states.values_mut() {
            *feature_state = FeatureState::PRISTINE;
        }
        for cell in state.hexes.values_mut() {
            cell.rust_level = if cell.center_rank == 0 {
                0.0
            } else {
                state.baseline_rust.get(&cell.id).copied().unwrap_or(0.0)
            };
        }
        state.tasks.clear();
        state.votes.clear();
        state.transfers.clear();
        state.feed.clear();
        for region in state.regions.values_mut() {
            region.pools = ctx.rules.starting_pools;
        }
        for crew in state.crews.values_mut() {
            crew.state = CrewState::Idle;
            if let Some(region) = state.regions.get(&crew.region_id) {
                crew.position = region.hub;
            }
        }
        state
            .meta
            .insert(LAST_RESET_KEY.to_owned(), serde_json::json!({ "at": ctx.now }));
        Ok(())
    }
}

/// traveling -> working
fn arrive_on_site(
    state: &mut MemoryState,
    crew: Crew,
    task_id: TaskId,
    destination: GeoPoint,
    ctx: &StepContext<'_>,
    delta: &mut TickDelta,
) {
    let Some(task) = state.tasks.get(&task_id).filter(|t| t.status == TaskStatus::Active) else {
        return;
    };
    let (feature_id, duration) = (task.feature_id, task.duration_secs);
    let Some(feature_state) = state.feature_states.get_mut(&feature_id) else {
        return;
    };
    feature_state.status = FeatureStatus::Repairing;
    delta.features.push(FeatureDelta {
        feature_id,
        health: feature_state.health,
        status: feature_state.status,
    });

    let work_secs = crew::repair_duration_secs(duration, &ctx.multipliers);
    if let Some(entry) = state.crews.get_mut(&crew.id) {
        entry.state = CrewState::Working {
            task_id,
            busy_until: ctx.now + Duration::seconds(work_secs),
        };
        entry.position = destination;
        delta.crews.push(crew_delta(entry));
    }
    delta
        .feed
        .push(narrate::repair_started(task_id, crew.region_id, work_secs, ctx.now));
}

/// working -> traveling (next task) or returning
fn finish_repair(state: &mut MemoryState, crew: Crew, task_id: TaskId, ctx: &StepContext<'_>, delta: &mut TickDelta) {
    let Some(task) = state.tasks.get_mut(&task_id).filter(|t| t.status == TaskStatus::Active) else {
        return;
    };
    let Some(feature) = state.features.get(&task.feature_id) else {
        return;
    };
    let Some(before) = state.feature_states.get(&task.feature_id).copied() else {
        return;
    };

    task.status = TaskStatus::Done;
    task.completed_at = Some(ctx.now);
    delta.tasks.push(task_delta(task));

    let healed = crew::healed_state(before, task.repair_amount, &ctx.rules.decay);
    state.feature_states.insert(feature.id, healed);
    delta.features.push(FeatureDelta {
        feature_id: feature.id,
        health: healed.health,
        status: healed.status,
    });

    let pushback = crew::completion_pushback(&ctx.multipliers, &ctx.rules.crews);
    for hex_id in &feature.hexes {
        if let Some(cell) = state.hexes.get_mut(hex_id) {
            cell.rust_level = apply_pushback(cell.rust_level, pushback);
            delta.hexes.push(HexDelta {
                hex_id: cell.id,
                rust_level: cell.rust_level,
            });
        }
    }
    delta
        .feed
        .push(narrate::repair_completed(feature.id, crew.region_id, healed.health, ctx.now));

    let site = feature.position;
    let next_state = if let Some((next_task, next_site)) = state.claim_task(crew.region_id, site, ctx, delta) {
        let travel = state.travel_secs(crew.region_id, site, next_site, ctx);
        delta
            .feed
            .push(narrate::crew_dispatched(crew.id, crew.region_id, travel, true, ctx.now));
        CrewState::Traveling {
            task_id: next_task,
            busy_until: ctx.now + Duration::seconds(travel),
            destination: next_site,
        }
    } else {
        let hub = state.hub_of(crew.region_id).unwrap_or(site);
        let travel = state.travel_secs(crew.region_id, site, hub, ctx);
        CrewState::Returning {
            busy_until: ctx.now + Duration::seconds(travel),
        }
    };
    if let Some(entry) = state.crews.get_mut(&crew.id) {
        entry.state = next_state;
        entry.position = site;
        delta.crews.push(crew_delta(entry));
    }
}

fn sync_crews(state: &mut MemoryState, ctx: &StepContext<'_>, report: &mut CleanupReport) {
    let mut hex_counts: BTreeMap<RegionId, u32> = BTreeMap::new();
    for cell in state.hexes.values() {
        let n = hex_counts.entry(cell.region_id).or_default();
        *n = n.saturating_add(1);
    }

    let region_ids: Vec<RegionId> = state.regions.keys().copied().collect();
    for region_id in region_ids {
        let target = crew::target_crew_count(hex_counts.get(&region_id).copied().unwrap_or(0), &ctx.rules.crews);
        if let Some(region) = state.regions.get_mut(&region_id) {
            region.target_crews = target;
        }
        let roster: Vec<Crew> = state.crews.values().filter(|c| c.region_id == region_id).copied().collect();
        let current = u32::try_from(roster.len()).unwrap_or(u32::MAX);

        for _ in current..target {
            if state.add_idle_crew(region_id).is_some() {
                report.crews_added = report.crews_added.saturating_add(1);
            }
        }
        if current > target {
            let surplus = current - target;
            let removable: Vec<CrewId> = roster
                .iter()
                .filter(|c| c.state == CrewState::Idle)
                .map(|c| c.id)
                .take(usize::try_from(surplus).unwrap_or(usize::MAX))
                .collect();
            for id in removable {
                state.crews.remove(&id);
                report.crews_removed = report.crews_removed.saturating_add(1);
            }
        }
    }
}

fn recover_orphans(state: &mut MemoryState, ctx: &StepContext<'_>, report: &mut CleanupReport) {
    let claimed: BTreeSet<TaskId> = state.crews.values().filter_map(|c| c.state.active_task()).collect();

    let orphaned: Vec<TaskId> = state
        .tasks
        .values()
        .filter(|t| t.status == TaskStatus::Active && !claimed.contains(&t.id))
        .map(|t| t.id)
        .collect();
    for task_id in orphaned {
        let Some(task) = state.tasks.get_mut(&task_id) else {
            continue;
        };
        task.status = TaskStatus::Queued;
        if let Some(fs) = state.feature_states.get_mut(&task.feature_id) {
            if fs.status == FeatureStatus::Repairing {
                fs.status = status_for_health(fs.health, &ctx.rules.decay);
            }
        }
        report.tasks_requeued = report.tasks_requeued.saturating_add(1);
    }

    let stranded: Vec<Crew> = state
        .crews
        .values()
        .filter(|c| {
            c.state
                .active_task()
                .is_some_and(|id| state.tasks.get(&id).is_none_or(|t| t.status != TaskStatus::Active))
        })
        .copied()
        .collect();
    for crew in stranded {
        let hub = state.hub_of(crew.region_id).unwrap_or(crew.position);
        let travel = state.travel_secs(crew.region_id, crew.position, hub, ctx);
        if let Some(entry) = state.crews.get_mut(&crew.id) {
            entry.state = CrewState::Returning {
                busy_until: ctx.now + Duration::seconds(travel),
            };
        }
        report.crews_recalled = report.crews_recalled.saturating_add(1);
    }
}

/// Build a small world for tests and local runs: one region with a ring of
/// hex cells, one road per non-center cell, one generating building at the
/// center, and an idle crew.
pub fn demo_state(now: DateTime<Utc>, starting_pool: i64) -> MemoryState {
    use rustbelt_types::RoadClass;
    use rustbelt_world::hex::{AXIAL_DIRECTIONS, Axial};

    let mut state = MemoryState::default();
    let region_id = RegionId::new();
    let hub = GeoPoint::new(-83.05, 42.33);
    state.add_region(Region {
        id: region_id,
        name: "Midtown".to_owned(),
        hub,
        pools: ResourceAmounts::uniform(starting_pool),
        target_crews: 1,
        difficulty_multiplier: 1.0,
    });

    let center = HexCell {
        id: HexId::new(),
        region_id,
        q: 0,
        r: 0,
        rust_level: 0.0,
        center_rank: 0,
    };
    state.add_hex(center);
    state.add_feature(
        Feature {
            id: FeatureId::new(),
            region_id,
            kind: FeatureKind::Building,
            road_class: None,
            position: hub,
            hexes: vec![center.id],
            generates_resources: true,
        },
        FeatureState::PRISTINE,
    );

    for (i, &(q, r)) in AXIAL_DIRECTIONS.iter().enumerate() {
        let rank = Axial::new(q, r).distance(Axial::new(0, 0));
        let cell = HexCell {
            id: HexId::new(),
            region_id,
            q,
            r,
            rust_level: 0.1 * f64::from(u32::try_from(i).unwrap_or(0)),
            center_rank: rank,
        };
        state.add_hex(cell);
        let class = RoadClass::ALL.get(i).copied().unwrap_or(RoadClass::Residential);
        state.add_feature(
            Feature {
                id: FeatureId::new(),
                region_id,
                kind: FeatureKind::Road,
                road_class: Some(class),
                position: GeoPoint::new(hub.lon + 0.002 * f64::from(q), hub.lat + 0.002 * f64::from(r)),
                hexes: vec![center.id, cell.id],
                generates_resources: false,
            },
            FeatureState::PRISTINE,
        );
    }
    let _ = state.add_idle_crew(region_id);
    state
        .meta
        .insert(LAST_RESET_KEY.to_owned(), serde_json::json!({ "at": now }));
    state
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use rustbelt_types::{FeedKind, Phase, PhaseMultipliers, RoadClass};

    use super::*;
    use crate::rules::WorldRules;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn day() -> PhaseMultipliers {
        PhaseMultipliers {
            rust_spread: 0.1,
            decay: 0.5,
            generation: 10.0,
            repair_speed: 1.25,
        }
    }

    fn ctx(rules: &WorldRules, now: DateTime<Utc>) -> StepContext<'_> {
        StepContext {
            now,
            phase: Phase::Day,
            multipliers: day(),
            rules,
        }
    }

    struct Fixture {
        world: MemoryWorld,
        region_id: RegionId,
        road_id: FeatureId,
        hex_id: HexId,
        crew_id: CrewId,
    }

    /// One region, one road at health 50 next to the hub, one idle crew.
    fn fixture(pools: i64) -> Fixture {
        let mut state = MemoryState::default();
        let region_id = RegionId::new();
        let hub = GeoPoint::new(0.0, 0.0);
        state.add_region(Region {
            id: region_id,
            name: "Eastside".to_owned(),
            hub,
            pools: ResourceAmounts::uniform(pools),
            target_crews: 1,
            difficulty_multiplier: 1.0,
        });
        let hex = HexCell {
            id: HexId::new(),
            region_id,
            q: 1,
            r: 0,
            rust_level: 0.5,
            center_rank: 1,
        };
        state.add_hex(hex);
        let road_id = FeatureId::new();
        state.add_feature(
            Feature {
                id: road_id,
                region_id,
                kind: FeatureKind::Road,
                road_class: Some(RoadClass::Secondary),
                position: GeoPoint::new(0.001, 0.0),
                hexes: vec![hex.id],
                generates_resources: false,
            },
            FeatureState {
                health: 50.0,
                status: FeatureStatus::Degraded,
            },
        );
        let crew_id = state.add_idle_crew(region_id).unwrap();
        Fixture {
            world: MemoryWorld::with_state(state),
            region_id,
            road_id,
            hex_id: hex.id,
            crew_id,
        }
    }

    fn rules_with_uniform_cost(cost: i64, repair_amount: f64) -> WorldRules {
        let mut rules = WorldRules::default();
        rules.road_classes.secondary.costs = ResourceAmounts::uniform(cost);
        rules.road_classes.secondary.repair_amount = repair_amount;
        rules
    }

    #[tokio::test]
    async fn dispatch_debits_pools_and_activates_task() {
        let f = fixture(100);
        let rules = rules_with_uniform_cost(10, 25.0);
        let c = ctx(&rules, t0());

        let spawned = f.world.spawn_tasks(&c).await.unwrap();
        assert_eq!(spawned.tasks.len(), 1);
        let delta = f.world.dispatch_idle_crews(&c).await.unwrap();

        let s = f.world.snapshot().await;
        assert_eq!(s.regions.get(&f.region_id).map(|r| r.pools), Some(ResourceAmounts::uniform(90)));
        let task = s.tasks.values().next().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        let crew = s.crews.get(&f.crew_id).unwrap();
        assert_eq!(crew.state.status(), rustbelt_types::CrewStatus::Traveling);
        assert_eq!(crew.state.active_task(), Some(task.id));
        let expected = estimate_travel(None, GeoPoint::new(0.0, 0.0), GeoPoint::new(0.001, 0.0), t0(), &rules.travel);
        assert_eq!(crew.state.busy_until(), Some(expected.arrival(t0())));
        assert_eq!(delta.crews.len(), 1);
        assert_eq!(delta.regions.len(), 1);
    }

    #[tokio::test]
    async fn unaffordable_task_leaves_crew_idle() {
        let f = fixture(5);
        let rules = rules_with_uniform_cost(10, 25.0);
        let c = ctx(&rules, t0());
        let _ = f.world.spawn_tasks(&c).await.unwrap();
        let delta = f.world.dispatch_idle_crews(&c).await.unwrap();

        assert!(delta.is_empty());
        let s = f.world.snapshot().await;
        assert_eq!(s.regions.get(&f.region_id).map(|r| r.pools), Some(ResourceAmounts::uniform(5)));
        assert_eq!(s.crews.get(&f.crew_id).map(|c| c.state), Some(CrewState::Idle));
    }

    #[tokio::test]
    async fn full_repair_cycle_heals_and_pushes_back_rust() {
        let f = fixture(100);
        let rules = rules_with_uniform_cost(10, 25.0);
        let mut now = t0();
        let _ = f.world.spawn_tasks(&ctx(&rules, now)).await.unwrap();
        let _ = f.world.dispatch_idle_crews(&ctx(&rules, now)).await.unwrap();

        // Arrive: road flips to repairing, crew starts working.
        now += Duration::seconds(rules.travel.max_travel_secs);
        let _ = f.world.advance_crews(&ctx(&rules, now)).await.unwrap();
        let s = f.world.snapshot().await;
        assert_eq!(s.feature_states.get(&f.road_id).map(|fs| fs.status), Some(FeatureStatus::Repairing));
        assert_eq!(s.crews.get(&f.crew_id).map(|c| c.state.status()), Some(rustbelt_types::CrewStatus::Working));

        // Repairing roads do not decay.
        let decayed = f.world.decay_roads(&ctx(&rules, now)).await.unwrap();
        assert!(decayed.features.is_empty());

        // Finish: 50 + 25 = 75, normal; rust 0.5 - 0.028.
        now += Duration::hours(1);
        let delta = f.world.advance_crews(&ctx(&rules, now)).await.unwrap();
        let s = f.world.snapshot().await;
        let road = s.feature_states.get(&f.road_id).copied().unwrap();
        assert!((road.health - 75.0).abs() < 1e-9);
        assert_eq!(road.status, FeatureStatus::Normal);
        let rust = s.hexes.get(&f.hex_id).map(|h| h.rust_level).unwrap();
        assert!((rust - 0.472).abs() < 1e-9);
        assert!(s.tasks.values().all(|t| t.status == TaskStatus::Done && t.completed_at == Some(now)));
        let crew = s.crews.get(&f.crew_id).copied().unwrap();
        assert_eq!(crew.state.status(), rustbelt_types::CrewStatus::Returning);
        assert_eq!(crew.state.active_task(), None);
        assert!(delta.feed.iter().any(|e| e.kind == FeedKind::RepairCompleted));

        // Home again.
        now += Duration::hours(1);
        let _ = f.world.advance_crews(&ctx(&rules, now)).await.unwrap();
        let s = f.world.snapshot().await;
        assert_eq!(s.crews.get(&f.crew_id).map(|c| c.state), Some(CrewState::Idle));
    }

    #[tokio::test]
    async fn finished_crew_chains_into_next_task() {
        let f = fixture(100);
        let rules = rules_with_uniform_cost(10, 25.0);
        let mut now = t0();
        let _ = f.world.spawn_tasks(&ctx(&rules, now)).await.unwrap();
        let _ = f.world.dispatch_idle_crews(&ctx(&rules, now)).await.unwrap();

        // A second degraded road appears while the crew is away.
        let second = FeatureId::new();
        f.world
            .edit(|s| {
                s.add_feature(
                    Feature {
                        id: second,
                        region_id: f.region_id,
                        kind: FeatureKind::Road,
                        road_class: Some(RoadClass::Secondary),
                        position: GeoPoint::new(0.002, 0.0),
                        hexes: vec![f.hex_id],
                        generates_resources: false,
                    },
                    FeatureState {
                        health: 30.0,
                        status: FeatureStatus::Degraded,
                    },
                );
            })
            .await;
        let _ = f.world.spawn_tasks(&ctx(&rules, now)).await.unwrap();

        now += Duration::hours(1);
        let _ = f.world.advance_crews(&ctx(&rules, now)).await.unwrap();
        now += Duration::hours(1);
        let _ = f.world.advance_crews(&ctx(&rules, now)).await.unwrap();

        let s = f.world.snapshot().await;
        let crew = s.crews.get(&f.crew_id).copied().unwrap();
        let next = s.tasks.values().find(|t| t.feature_id == second).unwrap();
        assert_eq!(crew.state.active_task(), Some(next.id));
        assert_eq!(crew.state.status(), rustbelt_types::CrewStatus::Traveling);
        assert_eq!(s.regions.get(&f.region_id).map(|r| r.pools), Some(ResourceAmounts::uniform(80)));
    }

    #[tokio::test]
    async fn spawn_is_idempotent_per_road() {
        let f = fixture(100);
        let rules = WorldRules::default();
        let c = ctx(&rules, t0());
        let first = f.world.spawn_tasks(&c).await.unwrap();
        let second = f.world.spawn_tasks(&c).await.unwrap();
        assert_eq!(first.tasks.len(), 1);
        assert!(second.tasks.is_empty());
        let s = f.world.snapshot().await;
        let task = s.tasks.values().next().unwrap();
        // (100 - 50) * secondary weight 1.5
        assert!((task.priority_score - 75.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn settlement_credits_exactly_once() {
        let world = MemoryWorld::with_state(demo_state(t0(), 0));
        let rules = WorldRules::default();
        let enqueued = world.generate_resources(&ctx(&rules, t0())).await.unwrap();
        assert_eq!(enqueued, 4);

        let later = t0() + Duration::seconds(rules.travel.max_travel_secs);
        let first = world.settle_transfers(&ctx(&rules, later)).await.unwrap();
        let second = world.settle_transfers(&ctx(&rules, later)).await.unwrap();
        assert_eq!(first.regions.len(), 1);
        assert!(second.regions.is_empty());

        let s = world.snapshot().await;
        let pools = s.regions.values().next().map(|r| r.pools).unwrap();
        // Center building has no rust: floor(1.0 * 10) per category.
        assert_eq!(pools, ResourceAmounts::uniform(10));
        assert!(s.transfers.values().all(|t| t.status == TransferStatus::Arrived));
    }

    #[tokio::test]
    async fn transfers_wait_for_arrival() {
        let world = MemoryWorld::with_state(demo_state(t0(), 0));
        let rules = WorldRules::default();
        let _ = world.generate_resources(&ctx(&rules, t0())).await.unwrap();
        let early = world.settle_transfers(&ctx(&rules, t0())).await.unwrap();
        assert!(early.regions.is_empty());
    }

    #[tokio::test]
    async fn votes_upsert_and_raise_priority() {
        let f = fixture(100);
        let rules = WorldRules::default();
        let c = ctx(&rules, t0());
        let _ = f.world.spawn_tasks(&c).await.unwrap();
        let task_id = f.world.snapshot().await.tasks.keys().next().copied().unwrap();
        let voter = VoterId::new();

        for weight in [5.0, 2.0] {
            f.world
                .cast_vote(&Vote {
                    task_id,
                    voter_id: voter,
                    weight,
                    created_at: t0(),
                })
                .await
                .unwrap();
        }
        let delta = f.world.refresh_priorities(&c).await.unwrap();
        let s = f.world.snapshot().await;
        assert_eq!(s.votes.len(), 1);
        let task = s.tasks.get(&task_id).unwrap();
        assert!((task.vote_score - 2.0).abs() < 1e-9);
        assert!((task.priority_score - 77.0).abs() < 1e-9);
        assert_eq!(delta.tasks.len(), 1);
    }

    #[tokio::test]
    async fn bad_votes_rejected() {
        let f = fixture(100);
        let rules = WorldRules::default();
        let _ = f.world.spawn_tasks(&ctx(&rules, t0())).await.unwrap();
        let task_id = f.world.snapshot().await.tasks.keys().next().copied().unwrap();

        let zero = Vote {
            task_id,
            voter_id: VoterId::new(),
            weight: 0.0,
            created_at: t0(),
        };
        assert!(matches!(f.world.cast_vote(&zero).await, Err(BackendError::InvalidVote { .. })));

        let unknown = Vote {
            task_id: TaskId::new(),
            weight: 1.0,
            ..zero
        };
        assert!(matches!(f.world.cast_vote(&unknown).await, Err(BackendError::TaskNotVotable(_))));
    }

    #[tokio::test]
    async fn cleanup_requeues_orphans_and_sizes_roster() {
        let f = fixture(100);
        let rules = WorldRules::default();
        let c = ctx(&rules, t0());
        let _ = f.world.spawn_tasks(&c).await.unwrap();
        f.world
            .edit(|s| {
                for task in s.tasks.values_mut() {
                    task.status = TaskStatus::Active;
                }
                let extra = s.add_idle_crew(f.region_id);
                assert!(extra.is_some());
            })
            .await;

        let report = f.world.cleanup(&c).await.unwrap();
        assert_eq!(report.tasks_requeued, 1);
        assert_eq!(report.crews_removed, 1);
        let s = f.world.snapshot().await;
        assert!(s.tasks.values().all(|t| t.status == TaskStatus::Queued));
        assert_eq!(s.crews.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_recalls_crews_with_missing_tasks() {
        let f = fixture(100);
        let rules = WorldRules::default();
        f.world
            .edit(|s| {
                if let Some(crew) = s.crews.get_mut(&f.crew_id) {
                    crew.state = CrewState::Working {
                        task_id: TaskId::new(),
                        busy_until: t0(),
                    };
                }
            })
            .await;
        let report = f.world.cleanup(&ctx(&rules, t0())).await.unwrap();
        assert_eq!(report.crews_recalled, 1);
        let s = f.world.snapshot().await;
        assert_eq!(s.crews.get(&f.crew_id).map(|c| c.state.status()), Some(rustbelt_types::CrewStatus::Returning));
    }

    #[tokio::test]
    async fn reset_restores_starting_state() {
        let world = MemoryWorld::with_state(demo_state(t0(), 10));
        let rules = WorldRules::default();
        let c = ctx(&rules, t0());
        world
            .edit(|s| {
                for fs in s.feature_states.values_mut() {
                    fs.health = 20.0;
                    fs.status = FeatureStatus::Degraded;
                }
                for cell in s.hexes.values_mut() {
                    cell.rust_level = 0.9;
                }
            })
            .await;
        let _ = world.spawn_tasks(&c).await.unwrap();
        world.reset_world(&c).await.unwrap();

        let s = world.snapshot().await;
        assert!(s.tasks.is_empty());
        assert!(s.feature_states.values().all(|fs| *fs == FeatureState::PRISTINE));
        assert!(s.hexes.values().filter(|h| h.center_rank == 0).all(|h| h.rust_level.abs() < f64::EPSILON));
        for cell in s.hexes.values().filter(|h| h.center_rank > 0) {
            let baseline = s.baseline_rust.get(&cell.id).copied().unwrap();
            assert!((cell.rust_level - baseline).abs() < 1e-12);
        }
        assert!(s.regions.values().all(|r| r.pools == rules.starting_pools));
        assert!(s.meta.contains_key(LAST_RESET_KEY));
    }

    #[tokio::test]
    async fn tick_lock_is_exclusive() {
        let world = MemoryWorld::new();
        assert!(world.try_acquire_tick_lock().await.unwrap());
        assert!(!world.try_acquire_tick_lock().await.unwrap());
        world.release_tick_lock().await.unwrap();
        assert!(world.try_acquire_tick_lock().await.unwrap());
    }
}
