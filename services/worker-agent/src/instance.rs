//! Instance manager for the backends running on this worker.
//!
//! The instance manager:
//! - Launches backends on StartBackend, at most one per instance id
//! - Stops them on StopBackend, acknowledging unknown ids
//! - Probes them until ready, then keeps probing their health
//! - Notices when a backend exits on its own

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use gpufleet_id::InstanceId;
use gpufleet_types::{
    BackendKind, Endpoint, GpuDevice, ReportedInstance, ReportedState, StartBackendRequest,
    StartBackendResponse, StopBackendResponse,
};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendSet, Exit, Launch, Process};
use crate::config::SupervisionConfig;
use crate::ports::PortAllocator;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("no {0} backend is available on this worker")]
    UnsupportedBackend(BackendKind),

    #[error("GPU {0} does not exist on this worker")]
    UnknownGpu(u32),

    #[error("no free port left in the backend port range")]
    NoPort,

    #[error("failed to launch backend: {0:#}")]
    Launch(anyhow::Error),
}

/// A backend as tracked by the agent.
#[derive(Debug)]
struct ManagedBackend {
    request: StartBackendRequest,
    endpoint: Endpoint,
    port: u16,
    /// Distinguishes relaunches of the same instance id.
    generation: u64,
    state: ReportedState,
    exit_code: Option<i32>,
    message: Option<String>,
    started_at: Instant,
    failed_probes: u32,
    /// `None` while the launch is in flight.
    process: Option<Process>,
}

impl ManagedBackend {
    fn report(&self) -> ReportedInstance {
        ReportedInstance {
            instance_id: self.request.instance_id,
            state: self.state,
            endpoint: Some(self.endpoint.clone()),
            exit_code: self.exit_code,
            message: self.message.clone(),
        }
    }

    fn response(&self) -> StartBackendResponse {
        StartBackendResponse {
            instance_id: self.request.instance_id,
            endpoint: self.endpoint.clone(),
            state: self.state,
        }
    }

    fn exited(&mut self, exit: Exit) {
        self.state = ReportedState::Exited;
        self.exit_code = exit.code;
        self.message = Some(exit.message);
    }

    /// Non-head group members serve nothing; being alive is being ready.
    fn probed_over_http(&self) -> bool {
        self.request.group.as_ref().is_none_or(|g| g.is_head())
    }
}

struct ProbeTarget {
    instance_id: InstanceId,
    generation: u64,
    backend: Arc<dyn Backend>,
    endpoint: Endpoint,
    http: bool,
}

/// Instance manager.
pub struct InstanceManager {
    backends: BackendSet,
    ports: PortAllocator,
    /// Host that backend endpoints are advertised at.
    host: String,
    gpus: Vec<GpuDevice>,
    supervision: SupervisionConfig,
    probe_client: reqwest::Client,
    instances: Mutex<HashMap<InstanceId, ManagedBackend>>,
    generations: std::sync::atomic::AtomicU64,
}

impl InstanceManager {
    pub fn new(
        backends: BackendSet,
        ports: PortAllocator,
        host: String,
        gpus: Vec<GpuDevice>,
        supervision: SupervisionConfig,
    ) -> anyhow::Result<Self> {
        let probe_client = reqwest::Client::builder()
            .timeout(supervision.probe_timeout)
            .build()?;
        Ok(Self {
            backends,
            ports,
            host,
            gpus,
            supervision,
            probe_client,
            instances: Mutex::new(HashMap::new()),
            generations: std::sync::atomic::AtomicU64::new(1),
        })
    }

    pub fn supervision(&self) -> &SupervisionConfig {
        &self.supervision
    }

    /// Starts a backend unless one for the instance is already known.
    ///
    /// An exited backend is relaunched in place, which is how the control
    /// plane restarts an instance.
    pub async fn start(
        &self,
        request: StartBackendRequest,
    ) -> Result<StartBackendResponse, StartError> {
        let instance_id = request.instance_id;
        let backend = self
            .backends
            .get(request.backend)
            .ok_or(StartError::UnsupportedBackend(request.backend))?;
        if let Some(missing) = request
            .gpu_indexes
            .iter()
            .find(|i| !self.gpus.iter().any(|g| g.index == **i))
        {
            return Err(StartError::UnknownGpu(*missing));
        }
        let vendor = request
            .gpu_indexes
            .first()
            .and_then(|i| self.gpus.iter().find(|g| g.index == *i))
            .map(|g| g.vendor);

        let (port, generation, stale) = {
            let mut instances = self.instances.lock().await;
            let stale = match instances.get(&instance_id) {
                Some(existing) if existing.state != ReportedState::Exited => {
                    debug!(instance_id = %instance_id, "Backend already known");
                    return Ok(existing.response());
                }
                Some(_) => instances.remove(&instance_id),
                None => None,
            };

            // A relaunch keeps the port of the exited backend.
            let port = match &stale {
                Some(stale) => stale.port,
                None => self.ports.allocate().ok_or(StartError::NoPort)?,
            };
            let generation = self
                .generations
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            instances.insert(
                instance_id,
                ManagedBackend {
                    request: request.clone(),
                    endpoint: Endpoint::new(self.host.clone(), port),
                    port,
                    generation,
                    state: ReportedState::Starting,
                    exit_code: None,
                    message: None,
                    started_at: Instant::now(),
                    failed_probes: 0,
                    process: None,
                },
            );
            (port, generation, stale.and_then(|s| s.process))
        };

        if let Some(mut stale) = stale {
            info!(instance_id = %instance_id, "Relaunching exited backend");
            if let Err(e) = backend.stop(&mut stale).await {
                warn!(instance_id = %instance_id, error = %e, "Error cleaning up exited backend");
            }
        }

        info!(
            instance_id = %instance_id,
            model = %request.model_name,
            revision = request.revision,
            backend = %request.backend,
            gpus = ?request.gpu_indexes,
            port,
            "Starting backend"
        );
        let launch = Launch {
            request,
            port,
            vendor,
        };

        match backend.start(&launch).await {
            Ok(mut process) => {
                let mut instances = self.instances.lock().await;
                match instances.get_mut(&instance_id) {
                    Some(entry) if entry.generation == generation => {
                        entry.process = Some(process);
                        Ok(entry.response())
                    }
                    _ => {
                        // Stopped while launching.
                        drop(instances);
                        if let Err(e) = backend.stop(&mut process).await {
                            warn!(instance_id = %instance_id, error = %e, "Failed to stop cancelled backend");
                        }
                        Ok(StartBackendResponse {
                            instance_id,
                            endpoint: Endpoint::new(self.host.clone(), port),
                            state: ReportedState::Exited,
                        })
                    }
                }
            }
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Failed to start backend");
                let mut instances = self.instances.lock().await;
                if instances
                    .get(&instance_id)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    instances.remove(&instance_id);
                    self.ports.release(port);
                }
                Err(StartError::Launch(e))
            }
        }
    }

    /// Stops the backend of an instance. Unknown instances are acknowledged.
    pub async fn stop(&self, instance_id: InstanceId) -> StopBackendResponse {
        let entry = self.instances.lock().await.remove(&instance_id);
        match entry {
            Some(entry) => {
                info!(instance_id = %instance_id, "Stopping backend");
                match self.backends.get(entry.request.backend) {
                    Some(backend) => self.release(backend.as_ref(), entry).await,
                    None => self.ports.release(entry.port),
                }
            }
            None => debug!(instance_id = %instance_id, "Stop for unknown backend acknowledged"),
        }
        StopBackendResponse {
            instance_id,
            acknowledged: true,
        }
    }

    async fn release(&self, backend: &dyn Backend, mut entry: ManagedBackend) {
        let instance_id = entry.request.instance_id;
        if let Some(process) = entry.process.as_mut() {
            if let Err(e) = backend.stop(process).await {
                warn!(instance_id = %instance_id, error = %e, "Error stopping backend");
            }
        }
        backend.forget(instance_id);
        self.ports.release(entry.port);
    }

    pub async fn stop_all(&self) {
        let ids: Vec<InstanceId> = self.instances.lock().await.keys().copied().collect();
        for instance_id in ids {
            self.stop(instance_id).await;
        }
    }

    /// Current state of every known backend, in id order.
    pub async fn report(&self) -> Vec<ReportedInstance> {
        let instances = self.instances.lock().await;
        let mut reports: Vec<_> = instances.values().map(ManagedBackend::report).collect();
        reports.sort_by_key(|r| r.instance_id);
        reports
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// One supervision round: exit detection, then readiness and health
    /// probes.
    pub async fn supervise(&self) {
        let mut targets = Vec::new();
        {
            let mut instances = self.instances.lock().await;
            for entry in instances.values_mut() {
                if entry.state == ReportedState::Exited {
                    continue;
                }
                let Some(backend) = self.backends.get(entry.request.backend) else {
                    continue;
                };
                let Some(process) = entry.process.as_mut() else {
                    continue;
                };
                if let Some(exit) = backend.exit_status(process).await {
                    warn!(
                        instance_id = %entry.request.instance_id,
                        exit_code = ?exit.code,
                        message = %exit.message,
                        "Backend exited"
                    );
                    entry.exited(exit);
                    continue;
                }
                targets.push(ProbeTarget {
                    instance_id: entry.request.instance_id,
                    generation: entry.generation,
                    backend,
                    endpoint: Endpoint::new("127.0.0.1", entry.port),
                    http: entry.probed_over_http(),
                });
            }
        }

        let health_path = self.supervision.health_path.as_str();
        let results = join_all(targets.iter().map(|t| async move {
            if !t.http {
                return true;
            }
            t.backend
                .probe(&self.probe_client, &t.endpoint, health_path)
                .await
        }))
        .await;

        let mut timed_out = Vec::new();
        {
            let mut instances = self.instances.lock().await;
            for (target, healthy) in targets.iter().zip(results) {
                let Some(entry) = instances.get_mut(&target.instance_id) else {
                    continue;
                };
                if entry.generation != target.generation {
                    continue;
                }
                self.apply_probe(entry, healthy);
                if entry.state == ReportedState::Exited {
                    if let Some(process) = entry.process.take() {
                        timed_out.push((target.backend.clone(), process));
                    }
                }
            }
        }

        for (backend, mut process) in timed_out {
            if let Err(e) = backend.stop(&mut process).await {
                warn!(error = %e, "Error stopping backend that never became ready");
            }
        }
    }

    fn apply_probe(&self, entry: &mut ManagedBackend, healthy: bool) {
        let instance_id = entry.request.instance_id;
        match (entry.state, healthy) {
            (ReportedState::Starting, true) => {
                info!(
                    instance_id = %instance_id,
                    startup_ms = entry.started_at.elapsed().as_millis() as u64,
                    "Backend ready"
                );
                entry.state = ReportedState::Running;
                entry.failed_probes = 0;
            }
            (ReportedState::Starting, false) => {
                if entry.started_at.elapsed() >= self.supervision.ready_timeout {
                    warn!(instance_id = %instance_id, "Backend not ready in time");
                    entry.exited(Exit {
                        code: None,
                        message: format!(
                            "backend not ready within {}s",
                            self.supervision.ready_timeout.as_secs()
                        ),
                    });
                }
            }
            (ReportedState::Running, true) => entry.failed_probes = 0,
            (ReportedState::Running, false) => {
                entry.failed_probes += 1;
                if entry.failed_probes >= self.supervision.unhealthy_threshold {
                    warn!(
                        instance_id = %instance_id,
                        failed_probes = entry.failed_probes,
                        "Backend unhealthy"
                    );
                    entry.state = ReportedState::Unhealthy;
                    entry.message = Some("health probe failing".to_string());
                }
            }
            (ReportedState::Unhealthy, true) => {
                info!(instance_id = %instance_id, "Backend recovered");
                entry.state = ReportedState::Running;
                entry.failed_probes = 0;
                entry.message = None;
            }
            (ReportedState::Unhealthy, false) | (ReportedState::Exited, _) => {}
        }
    }

    /// Runs supervision rounds until shutdown, then stops every backend.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.supervision.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.supervise().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Supervisor shutting down, stopping backends");
        self.stop_all().await;
    }
}
