use anyhow::Result;
use async_trait::async_trait;
use gpufleet_types::BackendKind;
use tracing::info;

use super::{Backend, CommandLine, Launch, Process, BIND_HOST};

/// Python serving engine with tensor and pipeline parallelism.
///
/// A replica spanning several workers runs as a ray cluster: the head starts
/// a ray head node and then the server with the ray executor, every other
/// member joins the head's cluster and blocks.
#[derive(Debug, Clone)]
pub struct VllmBackend {
    binary: String,
    ray: String,
    ray_port: u16,
}

impl VllmBackend {
    pub fn new(binary: String, ray: String, ray_port: u16) -> Self {
        Self {
            binary,
            ray,
            ray_port,
        }
    }

    pub fn command(&self, launch: &Launch) -> CommandLine {
        let request = &launch.request;

        if let Some(group) = launch.group().filter(|g| !g.is_head()) {
            let command = CommandLine::new(&self.ray)
                .args(["start", "--block"])
                .arg(format!("--address={}:{}", group.head_host, self.ray_port))
                .arg(format!("--num-gpus={}", request.gpu_indexes.len()));
            return launch.with_devices(command);
        }

        let mut command = CommandLine::new(&self.binary)
            .arg("serve")
            .arg(&request.source)
            .args(["--host", BIND_HOST])
            .arg("--port")
            .arg(launch.port.to_string())
            .arg("--served-model-name")
            .arg(&request.model_name)
            .arg("--tensor-parallel-size")
            .arg(request.parallelism.tensor.to_string())
            .arg("--pipeline-parallel-size")
            .arg(request.parallelism.pipeline.to_string());
        if launch.group().is_some() {
            command = command.args(["--distributed-executor-backend", "ray"]);
        }
        launch.with_devices(command.args(request.parameters.iter().cloned()))
    }

    fn ray_head(&self) -> CommandLine {
        CommandLine::new(&self.ray)
            .args(["start", "--head"])
            .arg(format!("--port={}", self.ray_port))
    }
}

#[async_trait]
impl Backend for VllmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vllm
    }

    async fn start(&self, launch: &Launch) -> Result<Process> {
        if launch.group().is_some_and(|g| g.is_head()) {
            self.ray_head().run().await?;
        }
        let command = self.command(launch);
        info!(
            instance_id = %launch.instance_id(),
            binary = %command.program,
            port = launch.port,
            group_rank = launch.group().map(|g| g.rank),
            "Launching vllm"
        );
        Ok(Process::Child(command.spawn(launch.instance_id())?))
    }
}
