//! Cycle clock, configuration and tick orchestration for the Rustbelt
//! simulation.
//!
//! # Modules
//!
//! - [`clock`] -- Fixed-length day cycle and reconciliation of the stored
//!   cycle record.
//! - [`config`] -- Loading `rustbelt-config.yaml` into typed structs.
//! - [`rules`] -- Validated tuning values shared by every step.
//! - [`backend`] -- The [`WorldBackend`] storage seam.
//! - [`memory`] -- An in-memory [`WorldBackend`].
//! - [`narrate`] -- Feed event wording.
//! - [`pipeline`] -- Resource pipeline with soft-dependency probing.
//! - [`notify`] -- Notification sink seam and channel allow-list.
//! - [`tick`] -- The tick orchestrator.
//! - [`runner`] -- Periodic tick driver.
//!
//! [`WorldBackend`]: backend::WorldBackend

pub mod backend;
pub mod clock;
pub mod config;
pub mod memory;
pub mod narrate;
pub mod notify;
pub mod pipeline;
pub mod rules;
pub mod runner;
pub mod tick;

pub use backend::{BackendError, CleanupReport, StepContext, WorldBackend};
pub use clock::{CycleClock, CycleRecord, PhaseView};
pub use config::{ConfigError, SimulationConfig};
pub use memory::MemoryWorld;
pub use notify::{NotificationSink, NotifyError, RecordingSink};
pub use rules::WorldRules;
pub use runner::{RunReport, RunnerError, run_periodic};
pub use tick::{TickEngine, TickError, TickOutcome, TickSummary};
