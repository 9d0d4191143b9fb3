//! The worker as the control plane sees it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gpufleet_id::WorkerId;
use gpufleet_types::{Capacity, HeartbeatReport};

use crate::instance::InstanceManager;

/// Identity and inventory of this worker plus its backends.
pub struct WorkerAgent {
    worker_id: WorkerId,
    name: String,
    address: String,
    labels: BTreeMap<String, String>,
    capacity: Capacity,
    draining: AtomicBool,
    instances: Arc<InstanceManager>,
}

impl WorkerAgent {
    pub fn new(
        worker_id: WorkerId,
        name: String,
        address: String,
        labels: BTreeMap<String, String>,
        capacity: Capacity,
        instances: Arc<InstanceManager>,
    ) -> Self {
        Self {
            worker_id,
            name,
            address,
            labels,
            capacity,
            draining: AtomicBool::new(false),
            instances,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn instances(&self) -> &Arc<InstanceManager> {
        &self.instances
    }

    /// A draining worker keeps its backends but receives no new placements.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub async fn report(&self) -> HeartbeatReport {
        HeartbeatReport {
            worker_id: self.worker_id,
            name: self.name.clone(),
            address: self.address.clone(),
            capacity: self.capacity.clone(),
            labels: self.labels.clone(),
            draining: self.is_draining(),
            instances: self.instances.report().await,
        }
    }
}
