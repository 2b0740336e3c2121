//! Pure world math for the Rustbelt simulation.
//!
//! Nothing in this crate performs I/O. Every function takes a snapshot of
//! the state it needs and returns the changes, so the same rules drive the
//! Postgres-backed world and the in-memory one.
//!
//! # Modules
//!
//! - [`hex`] -- Axial coordinates and the [`NeighborLookup`] capability.
//! - [`spread`] -- Rust spread and healthy-road pushback per hex cell.
//! - [`decay`] -- Road decay magnitude, status thresholds, delta filtering.
//! - [`road_class`] -- Typed per-class tuning table.
//! - [`routing`] -- Road graph, Dijkstra, travel-time estimation with
//!   great-circle fallback.
//! - [`generation`] -- Building output per resource category.
//! - [`priority`] -- Vote decay and task priority.
//! - [`crew`] -- Task selection order and repair arithmetic.
//! - [`error`] -- Error types.

pub mod convert;
pub mod crew;
pub mod decay;
pub mod error;
pub mod generation;
pub mod hex;
pub mod priority;
pub mod road_class;
pub mod routing;
pub mod spread;

pub use crew::{CrewParams, TaskCandidate, select_task};
pub use decay::{DecayOutcome, DecayParams};
pub use error::WorldError;
pub use hex::{Axial, AxialGrid, NeighborLookup};
pub use priority::VoteDecay;
pub use road_class::{RoadClassProfile, RoadClassTable};
pub use routing::{GraphProvider, NoGraphs, RoadGraph, TravelEstimate, TravelParams, estimate_travel};
pub use spread::{RoadTally, SpreadParams};
