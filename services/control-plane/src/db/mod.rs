//! State store for the control plane.
//!
//! [`StateStore`] is the single source of truth: models and their revisions,
//! the worker inventory, model instances, the reservation ledger and the
//! event log. [`PgStore`] is the production implementation; [`MemoryStore`]
//! backs development mode and tests.

mod error;
mod memory;
mod postgres;
mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{ApplyOutcome, ApplyResult, StateStore, WorkerChange};

use std::time::Duration;

use gpufleet_events::{InstanceStateChangedPayload, NewEvent};
use gpufleet_reconcile::SpecHash;
use gpufleet_types::{InstanceState, ModelInstance, ModelSpec};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/gpufleet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/gpufleet".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Postgres connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies pending migrations, loading them at runtime from the first
    /// directory that exists.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let candidates = [
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/control-plane/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Running database migrations");
                    migrator.run(&self.pool).await.map_err(StoreError::Migration)?;
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(StoreError::MigrationDirNotFound {
            tried: candidates
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }
}

/// Hash identifying the replica template of a spec.
pub fn template_hash(spec: &ModelSpec) -> String {
    SpecHash::from_json(&spec.template()).into_string()
}

/// Validates an optimistic instance write against the stored record and
/// returns what should be persisted.
fn prepare_instance_update(
    stored: &ModelInstance,
    next: &ModelInstance,
) -> Result<ModelInstance, StoreError> {
    if stored.version != next.version {
        return Err(StoreError::Conflict(format!(
            "instance {} is at version {}, write was based on {}",
            stored.id, stored.version, next.version
        )));
    }
    if !stored.state.can_transition_to(next.state) {
        return Err(gpufleet_types::TransitionError {
            from: stored.state,
            to: next.state,
        }
        .into());
    }
    if next.placement.is_some() && next.placement != stored.placement {
        return Err(StoreError::Conflict(format!(
            "instance {} placement can only change through a placement commit",
            stored.id
        )));
    }

    let mut out = next.clone();
    if out.state == InstanceState::Running {
        out.reservation_expires_at = None;
    }
    out.version += 1;
    Ok(out)
}

/// The state event for a write, if routing or status consumers care.
fn instance_event(
    before: Option<&ModelInstance>,
    after: &ModelInstance,
) -> Result<Option<NewEvent>, StoreError> {
    let changed = match before {
        None => true,
        Some(b) => b.state != after.state || b.endpoint != after.endpoint,
    };
    if !changed {
        return Ok(None);
    }
    let event = NewEvent::from_payload(&InstanceStateChangedPayload::of(after))
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(Some(event))
}
