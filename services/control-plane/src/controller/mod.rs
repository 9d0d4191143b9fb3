//! Model controller: per-model reconciliation, heartbeat ingestion and worker
//! liveness.
//!
//! - [`ModelReconciler`] converges one model toward its spec in a single pass
//! - [`ControllerWorker`] runs one single-flight loop per model
//! - [`HeartbeatProcessor`] turns worker reports into instance transitions
//! - [`LivenessMonitor`] marks silent workers NotReady after a grace period

mod heartbeat;
mod liveness;
mod reconciler;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use heartbeat::HeartbeatProcessor;
pub use liveness::{LivenessMonitor, SweepStats};
pub use reconciler::{ModelLoopState, ModelReconciler, ReconcileError, ReconcileReport};
pub use worker::{ControllerWorker, ReconcileTrigger};

use std::time::Duration;

use chrono::{DateTime, Utc};
use gpufleet_reconcile::DEFAULT_RECONCILE_INTERVAL;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Drift-correction period of every model loop.
    pub reconcile_interval: Duration,
    /// How long a placement may stay unconfirmed before it counts as a failed
    /// start.
    pub reservation_timeout: Duration,
    /// In-place restarts per placement before rescheduling.
    pub max_restarts: u32,
    /// Reschedules after repeated unhealthiness before the instance fails.
    pub max_reschedules: u32,
    /// Failed starts before the instance fails.
    pub max_start_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub backoff_jitter: f64,
    /// Delay before retrying after a concurrent write won.
    pub conflict_retry: Duration,
    /// A replica Running this long has its restart and reschedule counts
    /// forgiven.
    pub stable_after: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            reservation_timeout: Duration::from_secs(600),
            max_restarts: 3,
            max_reschedules: 3,
            max_start_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: 0.2,
            conflict_retry: Duration::from_secs(1),
            stable_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Interval agents are asked to heartbeat at.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before a worker becomes NotReady.
    pub grace_period: Duration,
    /// Silence after which a NotReady worker without reservations is removed.
    pub removal_after: Duration,
    /// How long an acknowledged instance may be missing from its worker's
    /// reports before it is considered exited.
    pub missing_report_grace: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            grace_period: Duration::from_secs(30),
            removal_after: Duration::from_secs(3600),
            missing_report_grace: Duration::from_secs(30),
        }
    }
}

/// `now + d`, saturating instead of overflowing.
pub(crate) fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time since `then`, zero if `then` is in the future.
pub(crate) fn elapsed(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}
