//! Tick engine binary for the Rustbelt simulation.
//!
//! Wires configuration, the Postgres world and the NATS notification sink
//! into a [`TickEngine`] and drives it on a fixed interval until Ctrl-C or
//! SIGTERM. Any number of engines may run against one database; the
//! advisory tick lock lets one of them tick at a time.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `rustbelt-config.yaml` (env overrides apply)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and run migrations
//! 4. Connect to NATS
//! 5. Build the tick engine
//! 6. Run the periodic driver, or reset the world and exit when started
//!    as `rustbelt-engine reset`

mod error;
mod nats_sink;
mod pg_backend;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rustbelt_core::config::LoggingConfig;
use rustbelt_core::{SimulationConfig, TickEngine, WorldBackend, run_periodic};
use rustbelt_db::{PostgresConfig, PostgresPool};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::nats_sink::NatsSink;
use crate::pg_backend::PgWorld;

const CONFIG_PATH: &str = "rustbelt-config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(&config.logging);

    info!(
        world_name = config.world.name,
        tick_interval_ms = config.world.tick_interval_ms,
        advisory_lock_id = config.world.advisory_lock_id,
        demo_multiplier = config.demo_multiplier(),
        "Configuration loaded"
    );

    let db_config = PostgresConfig::new(&config.infrastructure.postgres_url)
        .with_max_connections(config.infrastructure.max_connections);
    let db = PostgresPool::connect(&db_config).await.map_err(EngineError::from)?;
    db.run_migrations().await.map_err(EngineError::from)?;

    let sink = NatsSink::connect(&config.infrastructure.nats_url, &config.infrastructure.subject_prefix)
        .await
        .map_err(|e| EngineError::Nats { message: e.to_string() })?;
    info!(
        phase_subject = %sink.subject(rustbelt_types::Channel::Phase),
        "Notification sink ready"
    );

    let world = PgWorld::new(db.pool().clone(), config.world.advisory_lock_id);
    let mut engine = TickEngine::from_config(world, sink, &config).map_err(EngineError::from)?;

    if std::env::args().nth(1).as_deref() == Some("reset") {
        let done = engine.reset_world(Utc::now()).await.map_err(EngineError::from)?;
        if done {
            info!("World reset complete");
        } else {
            warn!("Tick lock held by a running engine, world not reset");
        }
    } else {
        let interval = Duration::from_millis(config.world.tick_interval_ms);
        let report = run_periodic(&mut engine, interval, shutdown_signal())
            .await
            .map_err(EngineError::from)?;
        info!(
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            "Tick driver finished"
        );
    }

    if let Err(e) = engine.backend().release_tick_lock().await {
        warn!(error = %e, "failed to release tick lock on shutdown");
    }
    if let Err(e) = engine.sink().flush().await {
        warn!(error = %e, "failed to flush notifications on shutdown");
    }
    db.close().await;

    info!("rustbelt-engine shutdown complete");
    Ok(())
}

/// Load `rustbelt-config.yaml` from the working directory, falling back to
/// defaults when it is absent. Environment overrides apply either way.
fn load_config() -> Result<SimulationConfig, EngineError> {
    let path = Path::new(CONFIG_PATH);
    let config = if path.exists() {
        SimulationConfig::from_file(path)?
    } else {
        SimulationConfig::parse("{}")?
    };
    Ok(config)
}

/// `RUST_LOG` wins over `logging.level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl-C received, shutting down"),
        () = terminate => info!("SIGTERM received, shutting down"),
    }
}
