//! Routing records derived from instance state.

use gpufleet_id::{EventId, InstanceId};
use serde::{Deserialize, Serialize};

use crate::instance::{Endpoint, InstanceState, ModelInstance};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEndpoint {
    pub instance_id: InstanceId,
    pub revision: u64,
    pub endpoint: Endpoint,
}

/// Running endpoints of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub model_name: String,
    pub endpoints: Vec<RouteEndpoint>,
}

impl RouteEntry {
    /// Builds the entry from the model's instances. Only Running instances
    /// with a known endpoint are routable.
    pub fn from_instances<'a>(
        model_name: &str,
        instances: impl IntoIterator<Item = &'a ModelInstance>,
    ) -> Self {
        let mut endpoints: Vec<RouteEndpoint> = instances
            .into_iter()
            .filter(|i| i.state == InstanceState::Running)
            .filter_map(|i| {
                Some(RouteEndpoint {
                    instance_id: i.id,
                    revision: i.revision,
                    endpoint: i.endpoint.clone()?,
                })
            })
            .collect();
        endpoints.sort_by_key(|e| e.instance_id);
        Self {
            model_name: model_name.to_string(),
            endpoints,
        }
    }
}

/// Full routing state plus the event position it reflects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutesSnapshot {
    pub cursor: EventId,
    pub routes: Vec<RouteEntry>,
}
