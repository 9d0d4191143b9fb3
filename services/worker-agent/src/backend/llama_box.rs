use anyhow::Result;
use async_trait::async_trait;
use gpufleet_types::BackendKind;
use tracing::info;

use super::{Backend, CommandLine, Launch, Process, BIND_HOST};

/// llama.cpp-family server binary.
#[derive(Debug, Clone)]
pub struct LlamaBoxBackend {
    binary: String,
}

impl LlamaBoxBackend {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }

    pub fn command(&self, launch: &Launch) -> CommandLine {
        let request = &launch.request;
        let command = CommandLine::new(&self.binary)
            .args(["--host", BIND_HOST])
            .arg("--port")
            .arg(launch.port.to_string())
            .arg("--model")
            .arg(&request.source)
            .arg("--alias")
            .arg(&request.model_name)
            .args(request.parameters.iter().cloned());
        launch.with_devices(command)
    }
}

#[async_trait]
impl Backend for LlamaBoxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LlamaBox
    }

    async fn start(&self, launch: &Launch) -> Result<Process> {
        let command = self.command(launch);
        info!(
            instance_id = %launch.instance_id(),
            binary = %command.program,
            port = launch.port,
            "Launching llama-box"
        );
        Ok(Process::Child(command.spawn(launch.instance_id())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::launch;

    #[test]
    fn command_serves_the_model_on_its_port() {
        let mut launch = launch(BackendKind::LlamaBox, 40001);
        launch.request.parameters = vec!["--ctx-size".into(), "8192".into()];
        let command = LlamaBoxBackend::new("/opt/llama-box".into()).command(&launch);

        assert_eq!(command.program, "/opt/llama-box");
        assert_eq!(
            command.args,
            [
                "--host",
                "0.0.0.0",
                "--port",
                "40001",
                "--model",
                "Qwen/Qwen2.5-7B-Instruct",
                "--alias",
                "qwen",
                "--ctx-size",
                "8192"
            ]
        );
        assert_eq!(
            command.env.get("CUDA_VISIBLE_DEVICES").map(String::as_str),
            Some("0,1")
        );
    }
}
