//! Reconciliation loop primitives.
//!
//! The controller compares a model's desired state with the instances the
//! store holds and converges one toward the other. The helpers here are pure
//! and deterministic (apart from backoff jitter) so the decisions they drive
//! can be tested without a store or a clock.

mod backoff;
mod drain;
mod hash;
mod rollout;

pub use backoff::Backoff;
pub use drain::{select_for_drain, DrainPriority};
pub use hash::SpecHash;
pub use rollout::{RollingStrategy, RolloutCounts, RolloutPlan};

use std::time::Duration;

/// Default period of the drift-correction tick.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(15);
