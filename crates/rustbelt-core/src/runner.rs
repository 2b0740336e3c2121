//! Periodic tick driver.
//!
//! [`run_periodic`] fires [`TickEngine::run_tick`] on a fixed interval
//! until the shutdown future resolves. Several drivers may run at once
//! against the same database; the tick lock makes all but one skip.
//!
//! A failed tick is logged and the loop carries on: every step reads
//! fresh state, so the next tick needs nothing from the failed one.
//! Intervals missed while a tick overran are dropped, not replayed.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::backend::WorldBackend;
use crate::notify::NotificationSink;
use crate::tick::{TickEngine, TickOutcome};

/// Errors that prevent the driver from starting.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The tick interval was zero.
    #[error("tick interval must be positive")]
    ZeroInterval,
}

/// Counts accumulated over a driver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunReport {
    /// Ticks that ran to completion.
    pub completed: u64,
    /// Ticks skipped because another driver held the lock.
    pub skipped: u64,
    /// Ticks that failed.
    pub failed: u64,
}

/// Drive ticks every `interval` until `shutdown` resolves.
///
/// The first tick fires immediately. A tick in progress when shutdown is
/// requested finishes first.
pub async fn run_periodic<B, S, F>(
    engine: &mut TickEngine<B, S>,
    interval: Duration,
    shutdown: F,
) -> Result<RunReport, RunnerError>
where
    B: WorldBackend,
    S: NotificationSink,
    F: Future<Output = ()> + Send,
{
    if interval.is_zero() {
        return Err(RunnerError::ZeroInterval);
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut report = RunReport::default();
    info!(interval_ms = interval.as_millis(), "tick driver started");

    loop {
        tokio::select! {
            biased;
            () = &mut shutdown => {
                info!(
                    completed = report.completed,
                    skipped = report.skipped,
                    failed = report.failed,
                    "tick driver stopping"
                );
                break;
            }
            _ = ticker.tick() => {
                match engine.run_tick(Utc::now()).await {
                    Ok(TickOutcome::Completed(_)) => report.completed = report.completed.saturating_add(1),
                    Ok(TickOutcome::Skipped) => report.skipped = report.skipped.saturating_add(1),
                    Err(e) => {
                        report.failed = report.failed.saturating_add(1);
                        error!(error = %e, "tick failed");
                    }
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::CycleClock;
    use crate::config::CycleConfig;
    use crate::memory::{MemoryWorld, demo_state};
    use crate::notify::RecordingSink;
    use crate::rules::WorldRules;

    fn engine() -> TickEngine<MemoryWorld, RecordingSink> {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().unwrap();
        TickEngine::new(
            MemoryWorld::with_state(demo_state(now, 100)),
            RecordingSink::new(),
            CycleClock::new(&CycleConfig::default(), 1.0).unwrap(),
            WorldRules::default(),
            chrono::Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn zero_interval_rejected() {
        let mut engine = engine();
        let result = run_periodic(&mut engine, Duration::ZERO, async {}).await;
        assert!(matches!(result, Err(RunnerError::ZeroInterval)));
    }

    #[tokio::test]
    async fn ticks_until_shutdown() {
        let mut engine = engine();
        let shutdown = tokio::time::sleep(Duration::from_millis(120));
        let report = run_periodic(&mut engine, Duration::from_millis(20), shutdown).await.unwrap();
        assert!(report.completed >= 1);
        assert_eq!(report.failed, 0);
        assert_eq!(engine.tick_count(), report.completed);
    }

    #[tokio::test]
    async fn contended_lock_counts_as_skipped() {
        let mut engine = engine();
        assert!(engine.backend().try_acquire_tick_lock().await.unwrap());
        let shutdown = tokio::time::sleep(Duration::from_millis(60));
        let report = run_periodic(&mut engine, Duration::from_millis(20), shutdown).await.unwrap();
        assert_eq!(report.completed, 0);
        assert!(report.skipped >= 1);
    }
}
