//! Proxy configuration.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::routing::BalancePolicy;

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the client-facing server binds to.
    pub listen_addr: String,

    /// Control plane base URL (example: http://localhost:8080).
    pub control_plane_url: String,

    /// Optional bearer token for the control plane API.
    pub control_plane_token: Option<String>,

    pub sync: SyncConfig,

    pub forward: ForwardConfig,

    pub policy: BalancePolicy,

    /// How long a backend that refused a connection stays out of rotation.
    pub suspect_cooldown: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Route table synchronization.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Max events to fetch per poll.
    pub fetch_limit: u32,

    /// Poll interval when no new events are available.
    pub poll_interval: Duration,

    /// Optional file holding the last applied table and cursor, so a
    /// restarted proxy serves traffic before the control plane answers.
    pub state_file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 200,
            poll_interval: Duration::from_millis(500),
            state_file: None,
        }
    }
}

/// Upstream request handling.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Largest request body the proxy buffers for retries.
    pub max_body_bytes: usize,

    pub connect_timeout: Duration,

    /// Time allowed until the backend sends response headers. Streaming
    /// bodies are not bounded by it.
    pub response_timeout: Duration,

    /// Backends tried per request, the first attempt included.
    pub max_attempts: u32,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 16 * 1024 * 1024,
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    std::env::var(key)
        .ok()
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key} is invalid: {e}"))
        })
        .transpose()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr =
            std::env::var("FLEET_PROXY_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        let control_plane_url = std::env::var("FLEET_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string());
        let control_plane_token = std::env::var("FLEET_CONTROL_PLANE_TOKEN").ok();

        let sync_defaults = SyncConfig::default();
        let fetch_limit = env_parse::<u32>("FLEET_SYNC_LIMIT")?
            .unwrap_or(sync_defaults.fetch_limit)
            .clamp(1, 1000);
        let poll_interval_ms: u64 = env_parse("FLEET_SYNC_POLL_INTERVAL_MS")
            .context("FLEET_SYNC_POLL_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(500);
        let state_file = std::env::var("FLEET_PROXY_STATE_FILE")
            .ok()
            .map(PathBuf::from);

        let forward_defaults = ForwardConfig::default();
        let forward = ForwardConfig {
            max_body_bytes: env_parse("FLEET_PROXY_MAX_BODY_BYTES")?
                .unwrap_or(forward_defaults.max_body_bytes),
            connect_timeout: env_parse::<u64>("FLEET_PROXY_CONNECT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(forward_defaults.connect_timeout),
            response_timeout: env_parse::<u64>("FLEET_PROXY_RESPONSE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(forward_defaults.response_timeout),
            max_attempts: env_parse::<u32>("FLEET_PROXY_MAX_ATTEMPTS")?
                .unwrap_or(forward_defaults.max_attempts)
                .max(1),
        };

        let policy = env_parse("FLEET_PROXY_POLICY")?.unwrap_or_default();
        let suspect_cooldown = Duration::from_secs(
            env_parse("FLEET_PROXY_SUSPECT_COOLDOWN_SECS")?.unwrap_or(10),
        );

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            control_plane_url,
            control_plane_token,
            sync: SyncConfig {
                fetch_limit,
                poll_interval: Duration::from_millis(poll_interval_ms.max(50)),
                state_file,
            },
            forward,
            policy,
            suspect_cooldown,
            log_level,
        })
    }
}
