//! [`WorldBackend`] on `PostgreSQL`.
//!
//! [`PgWorld`] is glue: each step loads the read-only context it needs
//! (features, regions, graphs), hands the matching rule from
//! [`rustbelt_world`] to a store that locks, writes and commits, and turns
//! what the store reports into a [`TickDelta`] with feed events.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::PgPool;
use tracing::debug;

use rustbelt_core::backend::{CYCLE_KEY, PRIORITY_EPSILON};
use rustbelt_core::narrate;
use rustbelt_core::{BackendError, CleanupReport, CycleRecord, StepContext, WorldBackend};
use rustbelt_db::{
    Advanced, CrewPlan, CrewStore, DbError, Dispatched, FeatureStore, FeedStore, GraphStore, HexStore, Maintenance,
    MetaStore, RegionStore, ResetValues, RetentionCutoffs, Settlement, TaskStore, TickLock, TransferStore,
};
use rustbelt_types::{
    Crew, CrewDelta, Feature, FeatureDelta, FeatureId, FeatureKind, FeatureStatus, Region, RegionDelta, RegionId,
    ResourceTransfer, Task, TaskDelta, TaskId, TaskStatus, TickDelta, TransferId, TransferStatus, Vote,
};
use rustbelt_world::decay::{average_rust, decay_magnitude, decay_road};
use rustbelt_world::spread::{spread_rust, tally_road_termini};
use rustbelt_world::{AxialGrid, RoadGraph, estimate_travel, generation, priority};

const TRANSFER_TABLE: &str = "resource_transfers";

/// A world stored in `PostgreSQL`.
#[derive(Debug)]
pub struct PgWorld {
    pool: PgPool,
    lock: TickLock,
}

impl PgWorld {
    /// A world on `pool`, serialized by advisory key `lock_id`.
    pub fn new(pool: PgPool, lock_id: i64) -> Self {
        let lock = TickLock::new(pool.clone(), lock_id);
        Self { pool, lock }
    }

    async fn features(&self) -> Result<BTreeMap<FeatureId, Feature>, BackendError> {
        let features = FeatureStore::new(&self.pool)
            .load_features()
            .await
            .map_err(BackendError::storage)?;
        Ok(features.into_iter().map(|f| (f.id, f)).collect())
    }

    async fn regions(&self) -> Result<BTreeMap<RegionId, Region>, BackendError> {
        let regions = RegionStore::new(&self.pool)
            .load_all()
            .await
            .map_err(BackendError::storage)?;
        Ok(regions.into_iter().map(|r| (r.id, r)).collect())
    }

    async fn graphs(&self) -> Result<BTreeMap<RegionId, RoadGraph>, BackendError> {
        GraphStore::new(&self.pool)
            .load_graphs()
            .await
            .map_err(BackendError::storage)
    }
}

/// Storage errors on the transfer table, with a missing table reported as
/// the soft-dependency case.
fn transfer_error(err: DbError) -> BackendError {
    if err.is_undefined_table() {
        BackendError::StorageUnavailable {
            what: TRANSFER_TABLE.to_owned(),
        }
    } else {
        BackendError::storage(err)
    }
}

fn crew_plan<'a>(ctx: &StepContext<'a>, graphs: &'a BTreeMap<RegionId, RoadGraph>) -> CrewPlan<'a> {
    CrewPlan {
        now: ctx.now,
        multipliers: ctx.multipliers,
        road_classes: &ctx.rules.road_classes,
        travel: &ctx.rules.travel,
        decay: &ctx.rules.decay,
        crews: &ctx.rules.crews,
        graphs,
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

fn task_delta(task_id: TaskId, feature_id: FeatureId, status: TaskStatus, priority_score: f64) -> TaskDelta {
    TaskDelta {
        task_id,
        feature_id,
        status,
        priority_score,
    }
}

fn record_dispatch(delta: &mut TickDelta, dispatched: &Dispatched, chained: bool, ctx: &StepContext<'_>) {
    let claim = &dispatched.claim;
    delta.regions.push(RegionDelta {
        region_id: claim.region_id,
        pools: claim.pools,
    });
    delta.tasks.push(task_delta(
        claim.task_id,
        claim.feature_id,
        TaskStatus::Active,
        claim.priority_score,
    ));
    delta.crews.push(crew_delta(&dispatched.crew));
    delta.feed.push(narrate::crew_dispatched(
        dispatched.crew.id,
        dispatched.crew.region_id,
        dispatched.travel_secs,
        chained,
        ctx.now,
    ));
}

fn record_advance(delta: &mut TickDelta, advanced: Advanced, ctx: &StepContext<'_>) {
    match advanced {
        Advanced::Arrived {
            crew,
            task_id,
            feature_id,
            state,
            work_secs,
        } => {
            delta.features.push(FeatureDelta {
                feature_id,
                health: state.health,
                status: state.status,
            });
            delta.crews.push(crew_delta(&crew));
            delta
                .feed
                .push(narrate::repair_started(task_id, crew.region_id, work_secs, ctx.now));
        }
        Advanced::Completed {
            crew,
            task_id,
            feature_id,
            priority_score,
            healed,
            hexes,
            next,
        } => {
            delta
                .tasks
                .push(task_delta(task_id, feature_id, TaskStatus::Done, priority_score));
            delta.features.push(FeatureDelta {
                feature_id,
                health: healed.health,
                status: healed.status,
            });
            delta.hexes.extend(hexes);
            delta
                .feed
                .push(narrate::repair_completed(feature_id, crew.region_id, healed.health, ctx.now));
            match next.map(|chained| *chained) {
                Some((claim, travel_secs)) => record_dispatch(
                    delta,
                    &Dispatched {
                        crew,
                        claim,
                        travel_secs,
                    },
                    true,
                    ctx,
                ),
                None => delta.crews.push(crew_delta(&crew)),
            }
        }
        Advanced::Returned { crew } => {
            delta.crews.push(crew_delta(&crew));
            delta.feed.push(narrate::crew_returned(crew.id, crew.region_id, ctx.now));
        }
    }
}

fn record_settlement(delta: &mut TickDelta, settlement: &Settlement, ctx: &StepContext<'_>) {
    delta.regions.push(RegionDelta {
        region_id: settlement.region_id,
        pools: settlement.pools,
    });
    let total: i64 = settlement.credited.iter().map(|(_, v)| v).sum();
    delta.feed.push(narrate::resources_delivered(
        settlement.region_id,
        &settlement.region_name,
        total,
        ctx.now,
    ));
}

impl WorldBackend for PgWorld {
    async fn try_acquire_tick_lock(&self) -> Result<bool, BackendError> {
        self.lock.try_acquire().await.map_err(BackendError::storage)
    }

    async fn release_tick_lock(&self) -> Result<(), BackendError> {
        self.lock.release().await.map_err(BackendError::storage)
    }

    async fn load_cycle_record(&self) -> Result<Option<serde_json::Value>, BackendError> {
        MetaStore::new(&self.pool)
            .get(CYCLE_KEY)
            .await
            .map_err(BackendError::storage)
    }

    async fn store_cycle_record(&self, record: &CycleRecord) -> Result<(), BackendError> {
        MetaStore::new(&self.pool)
            .put_json(CYCLE_KEY, record)
            .await
            .map_err(BackendError::storage)
    }

    async fn spread_rust(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let features: Vec<Feature> = self.features().await?.into_values().collect();
        let states = FeatureStore::new(&self.pool)
            .load_states()
            .await
            .map_err(BackendError::storage)?;
        let tallies = tally_road_termini(&features, &states, ctx.rules.spread.healthy_road_health);

        let hexes = HexStore::new(&self.pool)
            .spread_pass(|cells| {
                let grid = AxialGrid::from_cells(cells);
                spread_rust(cells, &grid, &tallies, &ctx.multipliers, &ctx.rules.spread)
            })
            .await
            .map_err(BackendError::storage)?;
        Ok(TickDelta {
            hexes,
            ..TickDelta::default()
        })
    }

    async fn decay_roads(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let features = self.features().await?;
        let regions = self.regions().await?;
        let rust = HexStore::new(&self.pool)
            .rust_levels()
            .await
            .map_err(BackendError::storage)?;

        let decayed = FeatureStore::new(&self.pool)
            .decay_pass(|feature_id, before| {
                let feature = features.get(&feature_id)?;
                let region = regions.get(&feature.region_id)?;
                let profile = ctx.rules.road_classes.get_or_default(feature.road_class);
                let magnitude = decay_magnitude(
                    profile.decay_rate,
                    average_rust(&feature.hexes, &rust),
                    ctx.multipliers.decay,
                    region.difficulty_multiplier,
                );
                decay_road(before, magnitude, &ctx.rules.decay)
            })
            .await
            .map_err(BackendError::storage)?;

        let mut delta = TickDelta::default();
        for road in decayed.iter().filter(|d| d.outcome.notable) {
            delta.features.push(FeatureDelta {
                feature_id: road.feature_id,
                health: road.outcome.state.health,
                status: road.outcome.state.status,
            });
            let Some(region) = features.get(&road.feature_id).and_then(|f| regions.get(&f.region_id)) else {
                continue;
            };
            delta.feed.extend(narrate::road_decayed(
                road.feature_id,
                region.id,
                &region.name,
                road.before.status,
                &road.outcome,
                ctx.now,
            ));
        }
        debug!(written = decayed.len(), notable = delta.features.len(), "roads decayed");
        Ok(delta)
    }

    async fn transfer_storage_available(&self) -> Result<bool, BackendError> {
        TransferStore::new(&self.pool)
            .table_exists()
            .await
            .map_err(BackendError::storage)
    }

    async fn generate_resources(&self, ctx: &StepContext<'_>) -> Result<u64, BackendError> {
        let features = self.features().await?;
        let regions = self.regions().await?;
        let graphs = self.graphs().await?;
        let rust = HexStore::new(&self.pool)
            .rust_levels()
            .await
            .map_err(BackendError::storage)?;

        let mut transfers = Vec::new();
        for building in features
            .values()
            .filter(|f| f.kind == FeatureKind::Building && f.generates_resources)
        {
            let Some(region) = regions.get(&building.region_id) else {
                continue;
            };
            let outputs = generation::building_output(average_rust(&building.hexes, &rust), &ctx.multipliers);
            if outputs.is_empty() {
                continue;
            }
            let estimate = estimate_travel(
                graphs.get(&building.region_id),
                building.position,
                region.hub,
                ctx.now,
                &ctx.rules.travel,
            );
            for (category, amount) in outputs {
                transfers.push(ResourceTransfer {
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

        TransferStore::new(&self.pool)
            .insert_batch(&transfers)
            .await
            .map_err(transfer_error)
    }

    async fn settle_transfers(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let settlements = TransferStore::new(&self.pool)
            .settle_due(ctx.now)
            .await
            .map_err(transfer_error)?;
        let mut delta = TickDelta::default();
        for settlement in &settlements {
            record_settlement(&mut delta, settlement, ctx);
        }
        Ok(delta)
    }

    async fn spawn_tasks(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let features = self.features().await?;
        let states = FeatureStore::new(&self.pool)
            .load_states()
            .await
            .map_err(BackendError::storage)?;
        let tasks = TaskStore::new(&self.pool);
        let covered: BTreeSet<FeatureId> = tasks
            .load_open()
            .await
            .map_err(BackendError::storage)?
            .into_iter()
            .map(|t| t.feature_id)
            .collect();

        let proposed: Vec<(Task, f64)> = features
            .values()
            .filter(|f| f.kind == FeatureKind::Road && !covered.contains(&f.id))
            .filter_map(|f| states.get(&f.id).map(|s| (f, *s)))
            .filter(|(_, s)| s.health < ctx.rules.decay.degraded_threshold && s.status != FeatureStatus::Repairing)
            .map(|(feature, state)| {
                let profile = ctx.rules.road_classes.get_or_default(feature.road_class);
                let task = Task {
                    id: TaskId::new(),
                    feature_id: feature.id,
                    region_id: feature.region_id,
                    status: TaskStatus::Queued,
                    costs: profile.costs,
                    duration_secs: profile.duration_secs,
                    repair_amount: profile.repair_amount,
                    priority_score: priority::baseline_priority(state.health, profile.priority_weight),
                    vote_score: 0.0,
                    created_at: ctx.now,
                    completed_at: None,
                };
                (task, state.health)
            })
            .collect();
        if proposed.is_empty() {
            return Ok(TickDelta::default());
        }

        let batch: Vec<Task> = proposed.iter().map(|(t, _)| t.clone()).collect();
        let inserted: BTreeSet<TaskId> = tasks
            .insert_new(&batch)
            .await
            .map_err(BackendError::storage)?
            .into_iter()
            .collect();

        let mut delta = TickDelta::default();
        for (task, health) in proposed.iter().filter(|(t, _)| inserted.contains(&t.id)) {
            delta.tasks.push(task_delta(task.id, task.feature_id, task.status, task.priority_score));
            delta
                .feed
                .push(narrate::task_spawned(task.id, task.region_id, *health, ctx.now));
        }
        Ok(delta)
    }

    async fn refresh_priorities(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let features = self.features().await?;
        let states = FeatureStore::new(&self.pool)
            .load_states()
            .await
            .map_err(BackendError::storage)?;

        let updates = TaskStore::new(&self.pool)
            .refresh_priorities(|task, votes| {
                let feature = features.get(&task.feature_id)?;
                let state = states.get(&task.feature_id)?;
                let weight = ctx.rules.road_classes.get_or_default(feature.road_class).priority_weight;
                let vote_score = ctx.rules.vote_decay.score(votes.iter().copied(), ctx.now);
                Some((vote_score, priority::priority_score(state.health, weight, vote_score)))
            })
            .await
            .map_err(BackendError::storage)?;

        let mut delta = TickDelta::default();
        for update in updates
            .iter()
            .filter(|u| (u.task.priority_score - u.previous_priority).abs() > PRIORITY_EPSILON)
        {
            delta.tasks.push(task_delta(
                update.task.id,
                update.task.feature_id,
                update.task.status,
                update.task.priority_score,
            ));
        }
        debug!(rescored = updates.len(), reported = delta.tasks.len(), "task priorities refreshed");
        Ok(delta)
    }

    async fn dispatch_idle_crews(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let graphs = self.graphs().await?;
        let dispatched = CrewStore::new(&self.pool)
            .dispatch_idle(&crew_plan(ctx, &graphs))
            .await
            .map_err(BackendError::storage)?;
        let mut delta = TickDelta::default();
        for crew in &dispatched {
            record_dispatch(&mut delta, crew, false, ctx);
        }
        Ok(delta)
    }

    async fn advance_crews(&self, ctx: &StepContext<'_>) -> Result<TickDelta, BackendError> {
        let graphs = self.graphs().await?;
        let advanced = CrewStore::new(&self.pool)
            .advance_due(&crew_plan(ctx, &graphs))
            .await
            .map_err(BackendError::storage)?;
        let mut delta = TickDelta::default();
        for transition in advanced {
            record_advance(&mut delta, transition, ctx);
        }
        Ok(delta)
    }

    async fn cleanup(&self, ctx: &StepContext<'_>) -> Result<CleanupReport, BackendError> {
        let maintenance = Maintenance::new(&self.pool);
        let roster = maintenance
            .sync_roster(&ctx.rules.crews)
            .await
            .map_err(BackendError::storage)?;
        let tasks_requeued = maintenance
            .requeue_orphans(&ctx.rules.decay)
            .await
            .map_err(BackendError::storage)?;
        let graphs = self.graphs().await?;
        let crews_recalled = maintenance
            .recall_stranded(&crew_plan(ctx, &graphs))
            .await
            .map_err(BackendError::storage)?;

        let retention = &ctx.rules.retention;
        let cutoffs = RetentionCutoffs {
            feed: retention.feed_cutoff(ctx.now),
            transfers: retention.transfer_cutoff(ctx.now),
            tasks: retention.task_cutoff(ctx.now),
            statement_timeout_ms: retention.statement_timeout_ms,
        };
        let transfers_present = self.transfer_storage_available().await?;
        let deleted = maintenance.delete_expired(&cutoffs, transfers_present).await;

        Ok(CleanupReport {
            crews_added: roster.added,
            crews_removed: roster.removed,
            tasks_requeued,
            crews_recalled,
            feed_deleted: deleted.feed,
            transfers_deleted: deleted.transfers,
            tasks_deleted: deleted.tasks,
        })
    }

    async fn record_feed(&self, delta: &TickDelta) -> Result<(), BackendError> {
        if delta.feed.is_empty() {
            return Ok(());
        }
        FeedStore::new(&self.pool)
            .insert_batch(&delta.feed)
            .await
            .map(|_| ())
            .map_err(BackendError::storage)
    }

    async fn cast_vote(&self, vote: &Vote) -> Result<(), BackendError> {
        if priority::validate_vote_weight(vote.weight).is_err() {
            return Err(BackendError::InvalidVote {
                voter: vote.voter_id,
                weight: vote.weight,
            });
        }
        let stored = TaskStore::new(&self.pool)
            .upsert_vote(vote)
            .await
            .map_err(BackendError::storage)?;
        if stored {
            Ok(())
        } else {
            Err(BackendError::TaskNotVotable(vote.task_id))
        }
    }

    async fn reset_world(&self, ctx: &StepContext<'_>) -> Result<(), BackendError> {
        let transfers_present = self.transfer_storage_available().await?;
        let values = ResetValues {
            pools: ctx.rules.starting_pools,
            at: ctx.now,
        };
        Maintenance::new(&self.pool)
            .reset_world(&values, transfers_present)
            .await
            .map_err(BackendError::storage)
    }
}
