//! Wire format between the control plane and worker agents.

use std::collections::BTreeMap;

use gpufleet_id::{InstanceId, ModelId, WorkerId};
use serde::{Deserialize, Serialize};

use crate::instance::Endpoint;
use crate::model::{BackendKind, ContainerSpec, Parallelism};
use crate::worker::Capacity;

/// Multi-node group a backend joins. Rank 0 is the head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub head: WorkerId,
    pub head_host: String,
    pub rank: u32,
    pub size: u32,
}

impl GroupMembership {
    pub fn is_head(&self) -> bool {
        self.rank == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBackendRequest {
    pub instance_id: InstanceId,
    pub model_id: ModelId,
    pub model_name: String,
    pub revision: u64,
    pub backend: BackendKind,
    pub source: String,
    pub gpu_indexes: Vec<u32>,
    #[serde(default)]
    pub parallelism: Parallelism,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub container: Option<ContainerSpec>,
    #[serde(default)]
    pub group: Option<GroupMembership>,
}

/// State of a backend as observed by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedState {
    Starting,
    Running,
    Unhealthy,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBackendResponse {
    pub instance_id: InstanceId,
    pub endpoint: Endpoint,
    pub state: ReportedState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopBackendResponse {
    pub instance_id: InstanceId,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedInstance {
    pub instance_id: InstanceId,
    pub state: ReportedState,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Everything a worker knows about itself. The control plane treats this as
/// the only evidence of instance liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub worker_id: WorkerId,
    pub name: String,
    pub address: String,
    pub capacity: Capacity,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub draining: bool,
    pub instances: Vec<ReportedInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub accepted: bool,
    pub next_heartbeat_secs: u64,
    /// Backends the worker runs that the control plane does not place there.
    #[serde(default)]
    pub stop_instances: Vec<InstanceId>,
}
