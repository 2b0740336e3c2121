//! `PostgreSQL` data layer for the Rustbelt simulation.
//!
//! Each store borrows the connection pool and runs one unit of work per
//! call: read with the row locks it needs, apply a rule from
//! [`rustbelt_world`] (passed in by the caller where the rule depends on
//! tick inputs), write back, commit. Nothing is cached between calls, so a
//! tick always re-derives state from the tables.
//!
//! # Locking
//!
//! ```text
//! tick            -> TickLock (session advisory lock, pinned connection)
//! spread / decay  -> FOR UPDATE SKIP LOCKED on cells / road states
//! dispatch        -> region FOR UPDATE, queued tasks SKIP LOCKED
//! crew transition -> crew SKIP LOCKED, one savepoint per crew
//! settlement      -> due transfers SKIP LOCKED inside one statement
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- Connection pool and migrations
//! - [`lock`] -- The global tick lock
//! - [`meta_store`] -- Keyed JSON blobs (cycle record, reset marker)
//! - [`region_store`] -- Regions and their pools
//! - [`hex_store`] -- Hex cells and the spread pass
//! - [`feature_store`] -- Features and the decay pass
//! - [`transfer_store`] -- Resource transfers and settlement
//! - [`task_store`] -- Repair tasks, priorities and votes
//! - [`crew_store`] -- Crew dispatch and transitions
//! - [`graph_store`] -- Routing graphs
//! - [`feed_store`] -- Feed events
//! - [`maintenance`] -- Roster sync, orphan recovery, retention, reset
//! - [`rows`] -- Row types and their domain conversions
//! - [`error`] -- Shared error types

pub mod crew_store;
pub mod error;
pub mod feature_store;
pub mod feed_store;
pub mod graph_store;
pub mod hex_store;
pub mod lock;
pub mod maintenance;
pub mod meta_store;
pub mod postgres;
pub mod region_store;
pub mod rows;
pub mod task_store;
pub mod transfer_store;

pub use crew_store::{Advanced, Claim, CrewPlan, CrewStore, Dispatched};
pub use error::DbError;
pub use feature_store::{DecayedRoad, FeatureStore};
pub use feed_store::FeedStore;
pub use graph_store::GraphStore;
pub use hex_store::HexStore;
pub use lock::TickLock;
pub use maintenance::{Maintenance, ResetValues, RetentionCounts, RetentionCutoffs, RosterChange};
pub use meta_store::MetaStore;
pub use postgres::{PostgresConfig, PostgresPool};
pub use region_store::RegionStore;
pub use task_store::{PriorityUpdate, TaskStore};
pub use transfer_store::{Settlement, TransferStore};
