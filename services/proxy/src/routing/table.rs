//! Route table keyed by model name.
//!
//! Readers load the current snapshot without locking; every update builds a
//! new snapshot and swaps it in whole, so a lookup never sees a table that
//! is half way through an update.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use gpufleet_id::InstanceId;
use gpufleet_types::{RouteEndpoint, RouteEntry};
use tracing::{debug, info};

/// Immutable snapshot of route data for lock-free reads.
#[derive(Debug, Default, Clone)]
struct RouteSnapshot {
    /// Running endpoints by model name, ordered by instance id.
    by_model: HashMap<String, Arc<Vec<RouteEndpoint>>>,
}

impl RouteSnapshot {
    fn from_entries(entries: Vec<RouteEntry>) -> Self {
        let by_model = entries
            .into_iter()
            .filter(|e| !e.endpoints.is_empty())
            .map(|mut e| {
                e.endpoints.sort_by_key(|ep| ep.instance_id);
                (e.model_name, Arc::new(e.endpoints))
            })
            .collect();
        Self { by_model }
    }

    fn with_endpoint(&self, model_name: &str, endpoint: RouteEndpoint) -> Self {
        // An instance belongs to exactly one model.
        let mut next = self.without_instance(endpoint.instance_id);
        let mut endpoints = next
            .by_model
            .get(model_name)
            .map(|e| e.as_ref().clone())
            .unwrap_or_default();
        endpoints.push(endpoint);
        endpoints.sort_by_key(|ep| ep.instance_id);
        next.by_model
            .insert(model_name.to_string(), Arc::new(endpoints));
        next
    }

    fn without_instance(&self, instance_id: InstanceId) -> Self {
        let mut by_model = HashMap::with_capacity(self.by_model.len());
        for (name, endpoints) in &self.by_model {
            if endpoints.iter().any(|ep| ep.instance_id == instance_id) {
                let remaining: Vec<RouteEndpoint> = endpoints
                    .iter()
                    .filter(|ep| ep.instance_id != instance_id)
                    .cloned()
                    .collect();
                if !remaining.is_empty() {
                    by_model.insert(name.clone(), Arc::new(remaining));
                }
            } else {
                by_model.insert(name.clone(), Arc::clone(endpoints));
            }
        }
        Self { by_model }
    }

    fn without_model(&self, model_name: &str) -> Self {
        let mut next = self.clone();
        next.by_model.remove(model_name);
        next
    }
}

/// Route table managing the routable endpoints of every model.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Replaces the whole table in a single pointer swap.
    pub fn replace(&self, entries: Vec<RouteEntry>) {
        let snapshot = RouteSnapshot::from_entries(entries);
        let model_count = snapshot.by_model.len();
        self.snapshot.store(Arc::new(snapshot));
        info!(model_count, "Route table replaced");
    }

    /// Adds or moves a routable instance.
    pub fn upsert(&self, model_name: &str, endpoint: RouteEndpoint) {
        let instance_id = endpoint.instance_id;
        self.snapshot
            .rcu(|current| current.with_endpoint(model_name, endpoint.clone()));
        debug!(model = %model_name, instance_id = %instance_id, "Route added");
    }

    /// Removes an instance from whichever model routes to it.
    pub fn remove_instance(&self, instance_id: InstanceId) -> bool {
        let mut removed = false;
        self.snapshot.rcu(|current| {
            removed = current
                .by_model
                .values()
                .any(|eps| eps.iter().any(|ep| ep.instance_id == instance_id));
            current.without_instance(instance_id)
        });
        if removed {
            debug!(instance_id = %instance_id, "Route removed");
        }
        removed
    }

    pub fn remove_model(&self, model_name: &str) {
        self.snapshot
            .rcu(|current| current.without_model(model_name));
        debug!(model = %model_name, "Model routes removed");
    }

    /// Running endpoints of a model, optionally pinned to one revision.
    pub fn lookup(&self, model_name: &str, revision: Option<u64>) -> Vec<RouteEndpoint> {
        let snapshot = self.snapshot.load();
        let Some(endpoints) = snapshot.by_model.get(model_name) else {
            return Vec::new();
        };
        match revision {
            None => endpoints.as_ref().clone(),
            Some(rev) => endpoints
                .iter()
                .filter(|ep| ep.revision == rev)
                .cloned()
                .collect(),
        }
    }

    /// Names of every model with at least one routable endpoint, sorted.
    pub fn models(&self) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let mut names: Vec<String> = snapshot.by_model.keys().cloned().collect();
        names.sort();
        names
    }

    /// Full table contents, used to persist it.
    pub fn entries(&self) -> Vec<RouteEntry> {
        let snapshot = self.snapshot.load();
        let mut entries: Vec<RouteEntry> = snapshot
            .by_model
            .iter()
            .map(|(name, endpoints)| RouteEntry {
                model_name: name.clone(),
                endpoints: endpoints.as_ref().clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        entries
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
