//! Configuration for the worker agent.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use gpufleet_id::WorkerId;
use gpufleet_types::{GpuDevice, GpuVendor};

/// Worker agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stable identity of this worker. Set it explicitly in production so a
    /// restarted agent keeps its placements.
    pub worker_id: WorkerId,

    pub name: String,

    /// Address the agent RPC server binds to.
    pub listen_addr: String,

    /// Base URL the control plane uses to reach this agent.
    pub advertise_url: String,

    /// Host that backend endpoints are reachable at.
    pub advertise_host: String,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Shared bearer token between agents and the control plane.
    pub agent_token: Option<String>,

    /// Initial heartbeat interval; the control plane may change it.
    pub heartbeat_interval: Duration,

    pub gpus: Vec<GpuDevice>,

    pub labels: BTreeMap<String, String>,

    /// Ports handed to backend processes.
    pub port_range: RangeInclusive<u16>,

    pub supervision: SupervisionConfig,

    pub binaries: BackendBinaries,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Readiness and health probing of backend processes.
#[derive(Debug, Clone)]
pub struct SupervisionConfig {
    /// How long a backend may stay Starting before it is given up on.
    pub ready_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before a Running backend turns Unhealthy.
    pub unhealthy_threshold: u32,
    pub health_path: String,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(600),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            unhealthy_threshold: 3,
            health_path: "/health".to_string(),
        }
    }
}

/// Executables the process backends launch.
#[derive(Debug, Clone)]
pub struct BackendBinaries {
    pub llama_box: String,
    pub vllm: String,
    /// Used by non-head members of a multi-node group to join the head.
    pub ray: String,
    pub ray_port: u16,
    pub docker: String,
}

impl Default for BackendBinaries {
    fn default() -> Self {
        Self {
            llama_box: "llama-box".to_string(),
            vllm: "vllm".to_string(),
            ray: "ray".to_string(),
            ray_port: 6379,
            docker: "/usr/bin/docker".to_string(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker_id = match std::env::var("FLEET_WORKER_ID") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid FLEET_WORKER_ID: {raw}"))?,
            Err(_) => WorkerId::new(),
        };

        let name = std::env::var("FLEET_WORKER_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("worker-{}", worker_id.short()));

        let listen_addr = env_or("FLEET_AGENT_LISTEN_ADDR", "0.0.0.0:9400");
        let advertise_host = env_or("FLEET_WORKER_HOST", "127.0.0.1");
        let advertise_url = std::env::var("FLEET_WORKER_ADDRESS")
            .unwrap_or_else(|_| format!("http://{advertise_host}:9400"));

        let gpus = match std::env::var("FLEET_WORKER_GPUS") {
            Ok(raw) => parse_gpus(&raw)?,
            Err(_) => Vec::new(),
        };
        let labels = match std::env::var("FLEET_WORKER_LABELS") {
            Ok(raw) => parse_labels(&raw)?,
            Err(_) => BTreeMap::new(),
        };
        let port_range = parse_port_range(&env_or("FLEET_WORKER_PORT_RANGE", "40000-40999"))?;

        let defaults = SupervisionConfig::default();
        let supervision = SupervisionConfig {
            ready_timeout: env_secs("FLEET_READY_TIMEOUT_SECS", 600),
            probe_interval: env_secs("FLEET_PROBE_INTERVAL_SECS", 5),
            health_path: env_or("FLEET_HEALTH_PATH", &defaults.health_path),
            ..defaults
        };

        let defaults = BackendBinaries::default();
        let binaries = BackendBinaries {
            llama_box: env_or("FLEET_LLAMA_BOX_BIN", &defaults.llama_box),
            vllm: env_or("FLEET_VLLM_BIN", &defaults.vllm),
            ray: env_or("FLEET_RAY_BIN", &defaults.ray),
            docker: env_or("FLEET_DOCKER_BIN", &defaults.docker),
            ..defaults
        };

        Ok(Self {
            worker_id,
            name,
            listen_addr,
            advertise_url,
            advertise_host,
            control_plane_url: env_or("FLEET_CONTROL_PLANE_URL", "http://127.0.0.1:8080"),
            agent_token: std::env::var("FLEET_AGENT_TOKEN").ok(),
            heartbeat_interval: env_secs("FLEET_HEARTBEAT_INTERVAL_SECS", 10),
            gpus,
            labels,
            port_range,
            supervision,
            binaries,
            log_level: env_or("FLEET_LOG_LEVEL", "info"),
        })
    }
}

/// Parses `vendor:class:memory_gib` entries separated by commas. Devices are
/// indexed in the order given.
pub fn parse_gpus(raw: &str) -> Result<Vec<GpuDevice>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(index, entry)| {
            let parts: Vec<&str> = entry.split(':').collect();
            let [vendor, class, memory_gib] = parts.as_slice() else {
                bail!("invalid GPU entry '{entry}', expected vendor:class:memory_gib");
            };
            let memory_gib: u64 = memory_gib
                .parse()
                .with_context(|| format!("invalid GPU memory in '{entry}'"))?;
            let vendor: GpuVendor = vendor.parse().unwrap_or(GpuVendor::Other);
            Ok(GpuDevice {
                index: index as u32,
                class: class.to_string(),
                vendor,
                memory_bytes: memory_gib << 30,
            })
        })
        .collect()
}

/// Parses `key=value` pairs separated by commas.
pub fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => bail!("invalid label '{pair}', expected key=value"),
        })
        .collect()
}

pub fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>> {
    let (start, end) = raw
        .split_once('-')
        .with_context(|| format!("invalid port range '{raw}', expected start-end"))?;
    let start: u16 = start.trim().parse().context("invalid port range start")?;
    let end: u16 = end.trim().parse().context("invalid port range end")?;
    if start == 0 || start > end {
        bail!("invalid port range '{raw}'");
    }
    Ok(start..=end)
}
