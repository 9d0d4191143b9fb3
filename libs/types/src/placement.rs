//! Scheduler output and the placement recorded on an instance.

use gpufleet_id::{InstanceId, WorkerId};
use serde::{Deserialize, Serialize};

/// Resources taken on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSlice {
    pub worker_id: WorkerId,
    pub gpu_indexes: Vec<u32>,
    pub memory_bytes: u64,
    pub cpu_millis: u64,
}

/// Where an instance lives. Single-node instances have exactly one member,
/// which is also the head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub head: WorkerId,
    pub members: Vec<WorkerSlice>,
}

impl Placement {
    pub fn worker_ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.members.iter().map(|m| m.worker_id)
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.members.iter().any(|m| m.worker_id == worker_id)
    }

    pub fn is_multi_node(&self) -> bool {
        self.members.len() > 1
    }
}

/// A joint, all-or-nothing assignment of one instance to one or more workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementDecision {
    pub instance_id: InstanceId,
    /// Head first, then the remaining members in rank order.
    pub slices: Vec<WorkerSlice>,
    pub score: f64,
}

impl PlacementDecision {
    pub fn head(&self) -> Option<WorkerId> {
        self.slices.first().map(|s| s.worker_id)
    }

    pub fn into_placement(self) -> Option<Placement> {
        let head = self.head()?;
        Some(Placement {
            head,
            members: self.slices,
        })
    }
}
