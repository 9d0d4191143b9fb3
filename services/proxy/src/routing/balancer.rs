//! Backend selection across the running endpoints of a model.
//!
//! - Round-robin or least-outstanding-requests, chosen per deployment
//! - An endpoint that refused a connection is suspect and skipped until its
//!   cooldown passes or a newer event announces it Running again

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gpufleet_id::InstanceId;
use gpufleet_types::RouteEndpoint;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    #[default]
    RoundRobin,
    LeastOutstanding,
}

impl fmt::Display for BalancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BalancePolicy::RoundRobin => "round_robin",
            BalancePolicy::LeastOutstanding => "least_outstanding",
        })
    }
}

impl FromStr for BalancePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "rr" => Ok(BalancePolicy::RoundRobin),
            "least_outstanding" | "least_requests" => Ok(BalancePolicy::LeastOutstanding),
            other => Err(format!("unknown balance policy '{other}'")),
        }
    }
}

/// Decrements the endpoint's in-flight counter when dropped.
///
/// Held by the response body stream, so a request counts as outstanding
/// until the client has received the whole body or gone away.
#[derive(Debug)]
pub struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Balancer {
    policy: BalancePolicy,
    suspect_cooldown: Duration,
    /// Round-robin cursor per model.
    cursors: Mutex<HashMap<String, usize>>,
    inflight: Mutex<HashMap<InstanceId, Arc<AtomicUsize>>>,
    /// Suspect endpoints and when they return to rotation.
    suspects: Mutex<HashMap<InstanceId, Instant>>,
}

impl Balancer {
    pub fn new(policy: BalancePolicy, suspect_cooldown: Duration) -> Self {
        Self {
            policy,
            suspect_cooldown,
            cursors: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            suspects: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    /// Picks an endpoint among `candidates`, skipping `tried` and suspects.
    pub fn pick(
        &self,
        model_name: &str,
        candidates: &[RouteEndpoint],
        tried: &HashSet<InstanceId>,
    ) -> Option<RouteEndpoint> {
        let eligible: Vec<&RouteEndpoint> = {
            let now = Instant::now();
            let mut suspects = lock(&self.suspects);
            suspects.retain(|_, until| *until > now);
            candidates
                .iter()
                .filter(|ep| !tried.contains(&ep.instance_id))
                .filter(|ep| !suspects.contains_key(&ep.instance_id))
                .collect()
        };
        if eligible.is_empty() {
            return None;
        }

        let picked = match self.policy {
            BalancePolicy::RoundRobin => {
                let mut cursors = lock(&self.cursors);
                let cursor = cursors.entry(model_name.to_string()).or_insert(0);
                let picked = eligible[*cursor % eligible.len()];
                *cursor = cursor.wrapping_add(1);
                picked
            }
            BalancePolicy::LeastOutstanding => {
                let inflight = lock(&self.inflight);
                let load = |ep: &RouteEndpoint| {
                    inflight
                        .get(&ep.instance_id)
                        .map(|c| c.load(Ordering::Acquire))
                        .unwrap_or(0)
                };
                // Ties go to the lowest instance id.
                eligible
                    .iter()
                    .copied()
                    .min_by_key(|ep| (load(ep), ep.instance_id))?
            }
        };
        Some(picked.clone())
    }

    /// Counts a request against the endpoint until the guard drops.
    pub fn begin(&self, instance_id: InstanceId) -> InflightGuard {
        let counter = Arc::clone(
            lock(&self.inflight)
                .entry(instance_id)
                .or_insert_with(|| Arc::new(AtomicUsize::new(0))),
        );
        counter.fetch_add(1, Ordering::AcqRel);
        InflightGuard { counter }
    }

    pub fn outstanding(&self, instance_id: InstanceId) -> usize {
        lock(&self.inflight)
            .get(&instance_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn mark_suspect(&self, instance_id: InstanceId) {
        let until = Instant::now() + self.suspect_cooldown;
        lock(&self.suspects).insert(instance_id, until);
        warn!(
            instance_id = %instance_id,
            cooldown_secs = self.suspect_cooldown.as_secs(),
            "Backend marked suspect"
        );
    }

    /// A fresh Running announcement puts the endpoint back in rotation.
    pub fn clear_suspect(&self, instance_id: InstanceId) {
        if lock(&self.suspects).remove(&instance_id).is_some() {
            debug!(instance_id = %instance_id, "Suspect cleared");
        }
    }

    pub fn is_suspect(&self, instance_id: InstanceId) -> bool {
        lock(&self.suspects)
            .get(&instance_id)
            .is_some_and(|until| *until > Instant::now())
    }

    /// Drops bookkeeping for an endpoint that left the route table.
    pub fn forget(&self, instance_id: InstanceId) {
        lock(&self.suspects).remove(&instance_id);
        let mut inflight = lock(&self.inflight);
        if inflight
            .get(&instance_id)
            .is_some_and(|c| c.load(Ordering::Acquire) == 0)
        {
            inflight.remove(&instance_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Critical sections never panic; recover the data if one somehow did.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
