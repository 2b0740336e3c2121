//! Shared type definitions for the Rustbelt city simulation.
//!
//! This crate is the single source of truth for the types that cross crate
//! boundaries: identifiers, enums, persisted entities, and the per-tick
//! delta payloads published to clients. Payload types are exported to
//! `TypeScript` via `ts-rs`.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for all entity identifiers
//! - [`enums`] -- Phases, road classes, statuses, resource categories, channels
//! - [`structs`] -- Regions, hex cells, features, tasks, votes, crews, transfers
//! - [`delta`] -- Per-tick change records and narrative feed events

pub mod delta;
pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use delta::{
    CrewDelta, DeltaCounts, FeatureDelta, FeedEvent, HexDelta, PhaseChange, RegionDelta,
    TaskDelta, TickDelta,
};
pub use enums::{
    Channel, CrewStatus, FeatureKind, FeatureStatus, FeedKind, Phase, ResourceCategory,
    RoadClass, TaskStatus, TransferStatus, UnknownVariant,
};
pub use ids::{CrewId, FeatureId, FeedEventId, HexId, NodeId, RegionId, TaskId, TransferId, VoterId};
pub use structs::{
    Crew, CrewState, Feature, FeatureState, GeoPoint, HexCell, PhaseMultipliers, Region,
    ResourceAmounts, ResourceTransfer, Task, Vote, Waypoint,
};
