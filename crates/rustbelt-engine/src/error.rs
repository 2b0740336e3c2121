//! Error types for the engine binary.
//!
//! [`EngineError`] covers startup: configuration, the database, the NATS
//! connection and building the tick engine. Once the driver is running,
//! per-tick failures are logged by the driver and never reach `main`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: rustbelt_core::ConfigError,
    },

    /// Database connection or migration failed.
    #[error("database error: {source}")]
    Database {
        /// The underlying data layer error.
        #[from]
        source: rustbelt_db::DbError,
    },

    /// The tick engine could not be built.
    #[error("tick engine error: {source}")]
    Tick {
        /// The underlying tick error.
        #[from]
        source: rustbelt_core::TickError,
    },

    /// The periodic driver refused to start.
    #[error("runner error: {source}")]
    Runner {
        /// The underlying runner error.
        #[from]
        source: rustbelt_core::RunnerError,
    },

    /// NATS connection failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },
}
