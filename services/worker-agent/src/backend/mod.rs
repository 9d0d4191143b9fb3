//! Inference backend adapters.
//!
//! Each [`BackendKind`] has one [`Backend`] implementation that knows how to
//! launch the engine, stop it, notice that it exited and probe it. The
//! instance manager only talks to this trait.

mod docker;
mod llama_box;
pub mod mock;
mod process;
mod vllm;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use gpufleet_id::InstanceId;
use gpufleet_types::{BackendKind, Endpoint, GpuVendor, GroupMembership, StartBackendRequest};

pub use docker::DockerBackend;
pub use llama_box::LlamaBoxBackend;
pub use mock::{MockBackend, MockBehavior};
pub use process::{ChildProcess, CommandLine, Exit, Process};
pub use vllm::VllmBackend;

use crate::config::BackendBinaries;

/// Address backend servers bind to.
pub const BIND_HOST: &str = "0.0.0.0";

const STOP_GRACE: Duration = Duration::from_secs(10);

/// Everything an adapter needs to launch one backend.
#[derive(Debug, Clone)]
pub struct Launch {
    pub request: StartBackendRequest,
    pub port: u16,
    /// Vendor of the assigned GPUs; `None` for CPU-only launches.
    pub vendor: Option<GpuVendor>,
}

impl Launch {
    pub fn instance_id(&self) -> InstanceId {
        self.request.instance_id
    }

    pub fn group(&self) -> Option<&GroupMembership> {
        self.request.group.as_ref()
    }

    /// A non-head member of a multi-node group serves no HTTP endpoint.
    pub fn is_group_member(&self) -> bool {
        self.group().is_some_and(|g| !g.is_head())
    }

    /// Environment variable restricting the engine to its assigned devices.
    pub fn visible_devices(&self) -> Option<(&'static str, String)> {
        let var = match self.vendor? {
            GpuVendor::Nvidia => "CUDA_VISIBLE_DEVICES",
            GpuVendor::Amd => "HIP_VISIBLE_DEVICES",
            GpuVendor::Ascend => "ASCEND_RT_VISIBLE_DEVICES",
            GpuVendor::Apple | GpuVendor::Other => return None,
        };
        let devices = self
            .request
            .gpu_indexes
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Some((var, devices))
    }

    fn with_devices(&self, command: CommandLine) -> CommandLine {
        match self.visible_devices() {
            Some((var, devices)) => command.env(var, devices),
            None => command,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Launches the engine. Returns once it exists, not once it is ready.
    async fn start(&self, launch: &Launch) -> Result<Process>;

    async fn stop(&self, process: &mut Process) -> Result<()> {
        match process {
            Process::Child(child) => child.terminate(STOP_GRACE).await,
            Process::InProcess(server) => {
                server.shutdown().await;
                Ok(())
            }
            Process::Container { .. } => Ok(()),
        }
    }

    /// How the backend ended, if it has.
    async fn exit_status(&self, process: &mut Process) -> Option<Exit> {
        match process {
            Process::Child(child) => child.try_exit(),
            Process::InProcess(server) => server.try_exit(),
            Process::Container { .. } => None,
        }
    }

    /// Whether the engine answers its health endpoint.
    async fn probe(&self, client: &reqwest::Client, endpoint: &Endpoint, path: &str) -> bool {
        let url = format!("{}{}", endpoint.base_url(), path);
        matches!(client.get(url).send().await, Ok(r) if r.status().is_success())
    }

    /// Drops bookkeeping kept for a stopped instance.
    fn forget(&self, _instance_id: InstanceId) {}
}

/// Backends available on this worker, by kind.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendSet {
    pub fn from_config(binaries: &BackendBinaries) -> Self {
        Self::default()
            .with(Arc::new(LlamaBoxBackend::new(binaries.llama_box.clone())))
            .with(Arc::new(VllmBackend::new(
                binaries.vllm.clone(),
                binaries.ray.clone(),
                binaries.ray_port,
            )))
            .with(Arc::new(DockerBackend::new(binaries.docker.clone())))
            .with(Arc::new(MockBackend::default()))
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::launch;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some(GpuVendor::Nvidia), Some(("CUDA_VISIBLE_DEVICES", "0,1")))]
    #[case(Some(GpuVendor::Amd), Some(("HIP_VISIBLE_DEVICES", "0,1")))]
    #[case(Some(GpuVendor::Ascend), Some(("ASCEND_RT_VISIBLE_DEVICES", "0,1")))]
    #[case(Some(GpuVendor::Apple), None)]
    #[case(None, None)]
    fn device_visibility_follows_vendor(
        #[case] vendor: Option<GpuVendor>,
        #[case] expected: Option<(&str, &str)>,
    ) {
        let mut launch = launch(BackendKind::Vllm, 40000);
        launch.vendor = vendor;
        let actual = launch.visible_devices();
        assert_eq!(
            actual.as_ref().map(|(k, v)| (*k, v.as_str())),
            expected
        );
    }

    #[test]
    fn every_kind_has_a_backend() {
        let set = BackendSet::from_config(&BackendBinaries::default());
        for kind in [
            BackendKind::LlamaBox,
            BackendKind::Vllm,
            BackendKind::Docker,
            BackendKind::Mock,
        ] {
            assert_eq!(set.get(kind).map(|b| b.kind()), Some(kind));
        }
    }
}
