//! In-memory fixtures for controller tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpufleet_id::{InstanceId, ModelId, WorkerId};
use gpufleet_types::{
    BackendKind, Capacity, Endpoint, GpuDevice, GpuVendor, HeartbeatAck, HeartbeatReport, Model,
    ModelInstance, ModelSpec, PlacementConstraints, ReportedInstance, ReportedState,
    ResourceRequirements, StartBackendRequest, StartBackendResponse, StopBackendResponse, Worker,
};
use tokio::sync::mpsc;

use super::{
    ControllerConfig, HeartbeatProcessor, LivenessConfig, LivenessMonitor, ModelLoopState,
    ModelReconciler, ReconcileTrigger,
};
use crate::agent_client::{AgentError, WorkerAgentClient};
use crate::db::{MemoryStore, StateStore};
use crate::scheduler::Scheduler;

#[derive(Default)]
struct FakeAgentState {
    starts: Vec<(WorkerId, StartBackendRequest)>,
    stops: Vec<(WorkerId, InstanceId)>,
    rejecting: HashSet<WorkerId>,
    unreachable: HashSet<WorkerId>,
    reports: HashMap<WorkerId, HeartbeatReport>,
}

/// Records every call; behaviour per worker is switchable.
#[derive(Default)]
pub(crate) struct FakeAgent {
    state: Mutex<FakeAgentState>,
}

impl FakeAgent {
    pub(crate) fn reject(&self, worker: WorkerId) {
        self.state.lock().unwrap().rejecting.insert(worker);
    }

    pub(crate) fn accept(&self, worker: WorkerId) {
        self.state.lock().unwrap().rejecting.remove(&worker);
    }

    pub(crate) fn unreachable(&self, worker: WorkerId) {
        self.state.lock().unwrap().unreachable.insert(worker);
    }

    pub(crate) fn reachable(&self, worker: WorkerId) {
        self.state.lock().unwrap().unreachable.remove(&worker);
    }

    pub(crate) fn set_report(&self, report: HeartbeatReport) {
        self.state
            .lock()
            .unwrap()
            .reports
            .insert(report.worker_id, report);
    }

    pub(crate) fn started(&self) -> Vec<(WorkerId, InstanceId)> {
        let state = self.state.lock().unwrap();
        state
            .starts
            .iter()
            .map(|(w, r)| (*w, r.instance_id))
            .collect()
    }

    pub(crate) fn start_requests(&self) -> Vec<(WorkerId, StartBackendRequest)> {
        self.state.lock().unwrap().starts.clone()
    }

    pub(crate) fn stopped(&self) -> Vec<InstanceId> {
        let state = self.state.lock().unwrap();
        state.stops.iter().map(|(_, id)| *id).collect()
    }
}

#[async_trait]
impl WorkerAgentClient for FakeAgent {
    async fn start_backend(
        &self,
        worker: &Worker,
        request: &StartBackendRequest,
    ) -> Result<StartBackendResponse, AgentError> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(&worker.id) {
            return Err(AgentError::Unreachable("connection refused".into()));
        }
        if state.rejecting.contains(&worker.id) {
            return Err(AgentError::Rejected {
                status: 422,
                message: "backend refused to start".into(),
            });
        }
        state.starts.push((worker.id, request.clone()));
        let port = 40000 + state.starts.len() as u16;
        Ok(StartBackendResponse {
            instance_id: request.instance_id,
            endpoint: Endpoint::new(worker.host(), port),
            state: ReportedState::Starting,
        })
    }

    async fn stop_backend(
        &self,
        worker: &Worker,
        instance_id: InstanceId,
    ) -> Result<StopBackendResponse, AgentError> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(&worker.id) {
            return Err(AgentError::Unreachable("connection refused".into()));
        }
        state.stops.push((worker.id, instance_id));
        Ok(StopBackendResponse {
            instance_id,
            acknowledged: true,
        })
    }

    async fn heartbeat(&self, worker: &Worker) -> Result<HeartbeatReport, AgentError> {
        let state = self.state.lock().unwrap();
        if state.unreachable.contains(&worker.id) {
            return Err(AgentError::Unreachable("connection refused".into()));
        }
        state
            .reports
            .get(&worker.id)
            .cloned()
            .ok_or(AgentError::Timeout)
    }
}

pub(crate) fn spec(name: &str, replicas: u32, gpus: u32) -> ModelSpec {
    ModelSpec {
        name: name.into(),
        source: "hf://Qwen/Qwen2.5-7B-Instruct-GGUF".into(),
        replicas,
        resources: ResourceRequirements::gpus(gpus),
        placement: PlacementConstraints::default(),
        backend: BackendKind::Mock,
        backend_parameters: vec![],
        container: None,
        max_surge: 1,
        max_unavailable: 0,
    }
}

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub agent: Arc<FakeAgent>,
    pub reconciler: Arc<ModelReconciler>,
    pub processor: Arc<HeartbeatProcessor>,
    pub liveness: LivenessMonitor,
    pub now: DateTime<Utc>,
    templates: Mutex<HashMap<WorkerId, HeartbeatReport>>,
    _triggers: mpsc::UnboundedReceiver<ModelId>,
}

pub(crate) fn harness() -> Harness {
    harness_with(ControllerConfig::default())
}

pub(crate) fn harness_with(config: ControllerConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let agent = Arc::new(FakeAgent::default());
    let (trigger, triggers) = ReconcileTrigger::new();
    let reconciler = Arc::new(ModelReconciler::new(
        store.clone(),
        agent.clone(),
        Scheduler::default(),
        config,
    ));
    let processor = Arc::new(HeartbeatProcessor::new(
        store.clone(),
        trigger.clone(),
        LivenessConfig::default(),
    ));
    let liveness = LivenessMonitor::new(store.clone(), agent.clone(), processor.clone(), trigger);
    Harness {
        store,
        agent,
        reconciler,
        processor,
        liveness,
        now: Utc::now(),
        templates: Mutex::new(HashMap::new()),
        _triggers: triggers,
    }
}

impl Harness {
    /// Registers a worker with `gpus` 24 GiB L4s through a first heartbeat.
    pub(crate) async fn add_worker(&self, gpus: u32) -> WorkerId {
        let n = self.templates.lock().unwrap().len() + 1;
        let report = HeartbeatReport {
            worker_id: WorkerId::new(),
            name: format!("gpu-{n}"),
            address: format!("http://10.0.0.{n}:9400"),
            capacity: Capacity {
                gpus: (0..gpus)
                    .map(|index| GpuDevice {
                        index,
                        class: "L4".into(),
                        vendor: GpuVendor::Nvidia,
                        memory_bytes: 24 << 30,
                    })
                    .collect(),
                cpu_millis: 16_000,
                memory_bytes: 64 << 30,
            },
            labels: Default::default(),
            draining: false,
            instances: vec![],
        };
        let id = report.worker_id;
        self.templates.lock().unwrap().insert(id, report.clone());
        self.processor.ingest(&report, self.now).await.unwrap();
        id
    }

    pub(crate) fn report_for(&self, worker: WorkerId, instances: Vec<ReportedInstance>) -> HeartbeatReport {
        let mut report = self.templates.lock().unwrap()[&worker].clone();
        report.instances = instances;
        report
    }

    pub(crate) async fn heartbeat(
        &self,
        worker: WorkerId,
        instances: Vec<ReportedInstance>,
    ) -> HeartbeatAck {
        self.heartbeat_at(worker, instances, self.now).await
    }

    pub(crate) async fn heartbeat_at(
        &self,
        worker: WorkerId,
        instances: Vec<ReportedInstance>,
        at: DateTime<Utc>,
    ) -> HeartbeatAck {
        let report = self.report_for(worker, instances);
        self.processor.ingest(&report, at).await.unwrap()
    }

    /// Every worker reports each backend it hosts as running; backends
    /// being terminated are reported gone.
    pub(crate) async fn report_all_running(&self) {
        let workers: Vec<WorkerId> = self.templates.lock().unwrap().keys().copied().collect();
        for worker in workers {
            let instances = self.store.instances_on_worker(worker).await.unwrap();
            let reported = instances
                .iter()
                .filter(|i| i.state.is_placed())
                .map(|i| ReportedInstance {
                    instance_id: i.id,
                    state: ReportedState::Running,
                    endpoint: i.endpoint.clone(),
                    exit_code: None,
                    message: None,
                })
                .collect();
            self.heartbeat(worker, reported).await;
        }
    }

    pub(crate) async fn apply(&self, spec: ModelSpec) -> Model {
        self.store.apply_model(spec, self.now).await.unwrap().model
    }

    pub(crate) async fn instances(&self, model_id: ModelId) -> Vec<ModelInstance> {
        self.store.list_instances(Some(model_id)).await.unwrap()
    }

    pub(crate) fn loop_state(&self) -> ModelLoopState {
        ModelLoopState::new(self.reconciler.config())
    }

    /// One pass with a fresh loop state.
    pub(crate) async fn reconcile(&self, model_id: ModelId) {
        self.reconcile_at(model_id, self.now).await;
    }

    pub(crate) async fn reconcile_at(&self, model_id: ModelId, at: DateTime<Utc>) {
        let mut state = self.loop_state();
        self.reconciler
            .reconcile(model_id, &mut state, at)
            .await
            .unwrap();
    }
}
