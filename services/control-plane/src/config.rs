use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::controller::{ControllerConfig, LivenessConfig};
use crate::db::DbConfig;
use crate::scheduler::ScoringWeights;

/// Where the control plane keeps its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Volatile; for development and tests only.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => bail!("unknown store backend '{other}' (expected postgres or memory)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub store: StoreBackend,
    pub database: DbConfig,
    /// Shared secret agents present as a bearer token, and that the control
    /// plane presents to agents.
    pub agent_token: Option<String>,
    pub agent_timeout: Duration,
    pub weights: ScoringWeights,
    pub controller: ControllerConfig,
    pub liveness: LivenessConfig,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FLEET_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("FLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let store = std::env::var("FLEET_STORE")
            .unwrap_or_else(|_| "postgres".to_string())
            .parse()?;

        let agent_token = std::env::var("FLEET_AGENT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let defaults = ScoringWeights::default();
        let weights = ScoringWeights {
            fragmentation: env_parse("FLEET_WEIGHT_FRAGMENTATION", defaults.fragmentation),
            load: env_parse("FLEET_WEIGHT_LOAD", defaults.load),
            locality: env_parse("FLEET_WEIGHT_LOCALITY", defaults.locality),
        };

        let c = ControllerConfig::default();
        let controller = ControllerConfig {
            reconcile_interval: env_secs(
                "FLEET_RECONCILE_INTERVAL_SECS",
                c.reconcile_interval.as_secs(),
            ),
            reservation_timeout: env_secs(
                "FLEET_RESERVATION_TIMEOUT_SECS",
                c.reservation_timeout.as_secs(),
            ),
            max_restarts: env_parse("FLEET_MAX_RESTARTS", c.max_restarts),
            max_reschedules: env_parse("FLEET_MAX_RESCHEDULES", c.max_reschedules),
            max_start_attempts: env_parse("FLEET_MAX_START_ATTEMPTS", c.max_start_attempts),
            backoff_base: Duration::from_millis(env_parse(
                "FLEET_BACKOFF_BASE_MS",
                c.backoff_base.as_millis() as u64,
            )),
            backoff_cap: env_secs("FLEET_BACKOFF_CAP_SECS", c.backoff_cap.as_secs()),
            stable_after: env_secs("FLEET_STABLE_AFTER_SECS", c.stable_after.as_secs()),
            ..c
        };

        let l = LivenessConfig::default();
        let liveness = LivenessConfig {
            heartbeat_interval: env_secs(
                "FLEET_HEARTBEAT_INTERVAL_SECS",
                l.heartbeat_interval.as_secs(),
            ),
            grace_period: env_secs("FLEET_HEARTBEAT_GRACE_SECS", l.grace_period.as_secs()),
            removal_after: env_secs("FLEET_WORKER_REMOVAL_SECS", l.removal_after.as_secs()),
            ..l
        };

        if liveness.grace_period <= liveness.heartbeat_interval {
            bail!("FLEET_HEARTBEAT_GRACE_SECS must exceed FLEET_HEARTBEAT_INTERVAL_SECS");
        }

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            store,
            database: DbConfig::from_env(),
            agent_token,
            agent_timeout: env_secs("FLEET_AGENT_TIMEOUT_SECS", 10),
            weights,
            controller,
            liveness,
        })
    }
}
