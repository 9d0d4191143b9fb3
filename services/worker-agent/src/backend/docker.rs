use anyhow::{bail, Result};
use async_trait::async_trait;
use gpufleet_id::InstanceId;
use gpufleet_types::{BackendKind, GpuVendor};
use tracing::{debug, info, warn};

use super::{Backend, CommandLine, Exit, Launch, Process};

/// Arbitrary server image started with `docker run -d`.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: String,
}

pub fn container_name(instance_id: InstanceId) -> String {
    format!("fleet_{}", instance_id.short())
}

impl DockerBackend {
    pub fn new(docker: String) -> Self {
        Self { docker }
    }

    pub fn run_command(&self, launch: &Launch) -> Result<CommandLine> {
        let Some(container) = launch.request.container.as_ref() else {
            bail!("docker backend requires a container spec");
        };

        let mut command = CommandLine::new(&self.docker)
            .args(["run", "-d", "--name"])
            .arg(container_name(launch.instance_id()));
        for (key, value) in &container.env {
            command = command.arg("-e").arg(format!("{key}={value}"));
        }
        if let Some((var, devices)) = launch.visible_devices() {
            command = match launch.vendor {
                Some(GpuVendor::Nvidia) => command.arg("--gpus").arg(format!("\"device={devices}\"")),
                _ => command.arg("-e").arg(format!("{var}={devices}")),
            };
        }
        command = command
            .arg("-p")
            .arg(format!("{}:{}", launch.port, container.container_port));
        if let Some(entrypoint) = &container.entrypoint {
            command = command.arg("--entrypoint").arg(entrypoint);
        }
        Ok(command
            .arg(&container.image)
            .args(container.command.iter().cloned())
            .args(launch.request.parameters.iter().cloned()))
    }

    fn remove(&self, name: &str) -> CommandLine {
        CommandLine::new(&self.docker).args(["rm", "-f", name])
    }

    fn inspect(&self, name: &str) -> CommandLine {
        CommandLine::new(&self.docker).args([
            "inspect",
            "-f",
            "{{.State.Running}} {{.State.ExitCode}}",
            name,
        ])
    }
}

/// Parses `docker inspect` output of the form `<running> <exit code>`.
fn parse_state(output: &str) -> Option<Exit> {
    let mut parts = output.split_whitespace();
    let running = parts.next()?;
    if running == "true" {
        return None;
    }
    let code = parts.next().and_then(|c| c.parse().ok());
    Some(Exit {
        code,
        message: match code {
            Some(code) => format!("container exited with code {code}"),
            None => "container stopped".to_string(),
        },
    })
}

#[async_trait]
impl Backend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn start(&self, launch: &Launch) -> Result<Process> {
        let name = container_name(launch.instance_id());
        let command = self.run_command(launch)?;

        // A container left behind by an earlier agent run holds the name.
        if self.remove(&name).run().await.is_ok() {
            debug!(container = %name, "Removed stale container");
        }

        let container_id = command.run().await?;
        info!(
            instance_id = %launch.instance_id(),
            container = %name,
            container_id = %container_id,
            port = launch.port,
            "Container started"
        );
        Ok(Process::Container { name })
    }

    async fn stop(&self, process: &mut Process) -> Result<()> {
        let Process::Container { name } = process else {
            return Ok(());
        };
        match self.remove(name).run().await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exit_status(&self, process: &mut Process) -> Option<Exit> {
        let Process::Container { name } = process else {
            return None;
        };
        match self.inspect(name).run().await {
            Ok(output) => parse_state(&output),
            Err(e) => {
                warn!(container = %name, error = %e, "Failed to inspect container");
                Some(Exit {
                    code: None,
                    message: "container disappeared".to_string(),
                })
            }
        }
    }
}
