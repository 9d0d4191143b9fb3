//! Handles to launched backends.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use gpufleet_id::InstanceId;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::mock::MockServer;

/// How a backend ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exit {
    pub code: Option<i32>,
    pub message: String,
}

/// A program invocation, kept as data so adapters can be tested without
/// launching anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        command
    }

    /// Starts a long-running process whose output is forwarded to the log.
    pub fn spawn(&self, instance_id: InstanceId) -> Result<ChildProcess> {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", self.program))?;

        let last_line = Arc::new(Mutex::new(None));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(instance_id, "stdout", stdout, None));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(
                instance_id,
                "stderr",
                stderr,
                Some(last_line.clone()),
            ));
        }
        Ok(ChildProcess { child, last_line })
    }

    /// Runs a short command to completion and returns its trimmed stdout.
    pub async fn run(&self) -> Result<String> {
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

async fn forward_output<R>(
    instance_id: InstanceId,
    stream: &'static str,
    reader: R,
    last_line: Option<Arc<Mutex<Option<String>>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(instance_id = %instance_id, stream, "{line}");
        if let Some(last) = &last_line {
            if !line.trim().is_empty() {
                *last.lock().unwrap_or_else(|e| e.into_inner()) = Some(line);
            }
        }
    }
}

/// A backend process started by the agent.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    last_line: Arc<Mutex<Option<String>>>,
}

impl ChildProcess {
    pub fn try_exit(&mut self) -> Option<Exit> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let mut message = format!("process exited with {status}");
                if let Some(line) = self.last_line.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                    message.push_str(": ");
                    message.push_str(line);
                }
                Some(Exit {
                    code: status.code(),
                    message,
                })
            }
            Ok(None) => None,
            Err(e) => Some(Exit {
                code: None,
                message: format!("lost track of process: {e}"),
            }),
        }
    }

    /// SIGTERM, then SIGKILL once `grace` has passed.
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.try_exit().is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc == 0 && tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                    return Ok(());
                }
            }
        }
        warn!(grace_secs = grace.as_secs(), "Backend ignored SIGTERM, killing");
        self.child.kill().await.context("failed to kill backend process")
    }
}

/// Whatever keeps a launched backend alive.
#[derive(Debug)]
pub enum Process {
    Child(ChildProcess),
    Container { name: String },
    InProcess(MockServer),
}
