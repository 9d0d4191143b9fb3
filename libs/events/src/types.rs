use gpufleet_id::{InstanceId, ModelId, WorkerId};
use gpufleet_types::{Endpoint, FailureReason, InstanceState, ModelInstance, WorkerHealth};
use serde::{Deserialize, Serialize};

use crate::envelope::{AggregateType, EventPayload};

pub mod event_types {
    pub const INSTANCE_STATE_CHANGED: &str = "instance.state_changed";
    pub const INSTANCE_DELETED: &str = "instance.deleted";
    pub const MODEL_REVISED: &str = "model.revised";
    pub const MODEL_DELETED: &str = "model.deleted";
    pub const WORKER_HEALTH_CHANGED: &str = "worker.health_changed";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStateChangedPayload {
    pub instance_id: InstanceId,
    pub model_id: ModelId,
    pub model_name: String,
    pub revision: u64,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl InstanceStateChangedPayload {
    pub fn of(instance: &ModelInstance) -> Self {
        Self {
            instance_id: instance.id,
            model_id: instance.model_id,
            model_name: instance.model_name.clone(),
            revision: instance.revision,
            state: instance.state,
            endpoint: instance.endpoint.clone(),
            worker_id: instance.worker_id(),
            reason: instance.failure.as_ref().map(|f| f.reason),
        }
    }

    /// Whether the instance may receive traffic after this event.
    pub fn is_routable(&self) -> bool {
        self.state == InstanceState::Running && self.endpoint.is_some()
    }
}

impl EventPayload for InstanceStateChangedPayload {
    const EVENT_TYPE: &'static str = event_types::INSTANCE_STATE_CHANGED;
    const AGGREGATE: AggregateType = AggregateType::Instance;

    fn aggregate_id(&self) -> String {
        self.instance_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDeletedPayload {
    pub instance_id: InstanceId,
    pub model_id: ModelId,
    pub model_name: String,
}

impl EventPayload for InstanceDeletedPayload {
    const EVENT_TYPE: &'static str = event_types::INSTANCE_DELETED;
    const AGGREGATE: AggregateType = AggregateType::Instance;

    fn aggregate_id(&self) -> String {
        self.instance_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRevisedPayload {
    pub model_id: ModelId,
    pub model_name: String,
    pub revision: u64,
    pub replicas: u32,
}

impl EventPayload for ModelRevisedPayload {
    const EVENT_TYPE: &'static str = event_types::MODEL_REVISED;
    const AGGREGATE: AggregateType = AggregateType::Model;

    fn aggregate_id(&self) -> String {
        self.model_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDeletedPayload {
    pub model_id: ModelId,
    pub model_name: String,
}

impl EventPayload for ModelDeletedPayload {
    const EVENT_TYPE: &'static str = event_types::MODEL_DELETED;
    const AGGREGATE: AggregateType = AggregateType::Model;

    fn aggregate_id(&self) -> String {
        self.model_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealthChangedPayload {
    pub worker_id: WorkerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<WorkerHealth>,
    pub health: WorkerHealth,
}

impl EventPayload for WorkerHealthChangedPayload {
    const EVENT_TYPE: &'static str = event_types::WORKER_HEALTH_CHANGED;
    const AGGREGATE: AggregateType = AggregateType::Worker;

    fn aggregate_id(&self) -> String {
        self.worker_id.to_string()
    }
}
