use gpufleet_id::WorkerId;
use gpufleet_types::{LedgerViolation, TransitionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// The record changed since it was read; re-read and retry.
    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Committing the reservation would over-commit the worker.
    #[error("worker {worker_id} cannot take the reservation: {violation}")]
    Capacity {
        worker_id: WorkerId,
        violation: LedgerViolation,
    },

    #[error("worker {0} is not accepting placements")]
    WorkerUnavailable(WorkerId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Errors that a fresh read of the store may resolve.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict(_) | StoreError::Capacity { .. } | StoreError::WorkerUnavailable(_)
        )
    }
}
