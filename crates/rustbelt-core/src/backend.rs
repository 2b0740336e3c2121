//! The storage seam the tick orchestrator drives.
//!
//! [`WorldBackend`] is one method per simulation step. Each step reads the
//! state it needs fresh from storage, applies the rules in
//! [`rustbelt_world`], writes the result in a transaction scoped to the
//! step (or to one crew), and returns the changes as a [`TickDelta`].
//!
//! Two implementations exist: the Postgres-backed world in the engine
//! binary and [`MemoryWorld`](crate::memory::MemoryWorld) for tests and
//! local runs.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::Serialize;

use rustbelt_types::{Phase, PhaseMultipliers, TaskId, TickDelta, Vote, VoterId};

use crate::clock::CycleRecord;
use crate::rules::WorldRules;

/// World-metadata key of the cycle record.
pub const CYCLE_KEY: &str = "cycle";

/// World-metadata key of the last reset marker.
pub const LAST_RESET_KEY: &str = "last_reset";

/// Priority changes up to this size are written but not reported.
pub const PRIORITY_EPSILON: f64 = 1e-3;

/// Errors surfaced by a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A soft dependency (resource transfer storage) is not provisioned.
    #[error("storage unavailable: {what}")]
    StorageUnavailable {
        /// Which storage is missing.
        what: String,
    },

    /// The vote targets a task that does not exist or is already done.
    #[error("task {0} does not accept votes")]
    TaskNotVotable(TaskId),

    /// The vote weight is zero or not finite.
    #[error("invalid vote weight {weight} from voter {voter}")]
    InvalidVote {
        /// Voter.
        voter: VoterId,
        /// Rejected weight.
        weight: f64,
    },

    /// The underlying store failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },
}

impl BackendError {
    /// Wrap any displayable error as a storage failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }

    /// Whether this is the soft-dependency case.
    pub const fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

/// Inputs shared by every step of one tick.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Tick wall time; every step uses this, not its own clock read.
    pub now: DateTime<Utc>,
    /// Active phase.
    pub phase: Phase,
    /// Multipliers for the active phase (demo scaling applied).
    pub multipliers: PhaseMultipliers,
    /// Tuning values.
    pub rules: &'a WorldRules,
}

/// Counts reported by the cleanup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CleanupReport {
    /// Crews created to reach a region's target.
    pub crews_added: u64,
    /// Idle crews removed above a region's target.
    pub crews_removed: u64,
    /// Active tasks no crew referenced, put back in the queue.
    pub tasks_requeued: u64,
    /// Crews whose task vanished, sent home.
    pub crews_recalled: u64,
    /// Feed events deleted by retention.
    pub feed_deleted: u64,
    /// Arrived transfers deleted by retention.
    pub transfers_deleted: u64,
    /// Done tasks deleted by retention.
    pub tasks_deleted: u64,
}

/// Persistence and per-step logic of a world.
///
/// Methods take `&self`; implementations own their synchronization
/// (a connection pool, or a mutex around in-memory state).
pub trait WorldBackend: Send + Sync {
    /// Try to take the global tick lock without waiting.
    ///
    /// Returns `false` when another holder has it.
    fn try_acquire_tick_lock(&self) -> impl Future<Output = Result<bool, BackendError>> + Send;

    /// Release the global tick lock. Releasing a lock not held is a no-op.
    fn release_tick_lock(&self) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// The raw stored cycle record, if any. May be malformed.
    fn load_cycle_record(&self) -> impl Future<Output = Result<Option<serde_json::Value>, BackendError>> + Send;

    /// Replace the stored cycle record.
    fn store_cycle_record(&self, record: &CycleRecord) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// One rust spread pass over every hex cell.
    fn spread_rust(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<TickDelta, BackendError>> + Send;

    /// One decay pass over every road.
    fn decay_roads(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<TickDelta, BackendError>> + Send;

    /// Whether the transfer storage exists.
    fn transfer_storage_available(&self) -> impl Future<Output = Result<bool, BackendError>> + Send;

    /// Create transfers for this tick's building output. Returns how many
    /// were enqueued.
    fn generate_resources(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<u64, BackendError>> + Send;

    /// Credit every due transfer exactly once.
    fn settle_transfers(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<TickDelta, BackendError>> + Send;

    /// Queue tasks for degraded roads that have none.
    fn spawn_tasks(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<TickDelta, BackendError>> + Send;

    /// Recompute vote and priority scores of open tasks.
    fn refresh_priorities(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<TickDelta, BackendError>> + Send;

    /// Send idle crews to the best affordable task in their region.
    fn dispatch_idle_crews(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<TickDelta, BackendError>> + Send;

    /// Move busy crews whose current leg has ended to their next state.
    fn advance_crews(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<TickDelta, BackendError>> + Send;

    /// Crew roster sync, orphan recovery and retention deletes.
    fn cleanup(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<CleanupReport, BackendError>> + Send;

    /// Persist the feed events of a tick.
    fn record_feed(&self, delta: &TickDelta) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Insert or replace one voter's vote on a task.
    fn cast_vote(&self, vote: &Vote) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Restore the world to its starting state.
    fn reset_world(&self, ctx: &StepContext<'_>) -> impl Future<Output = Result<(), BackendError>> + Send;
}
