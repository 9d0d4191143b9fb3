use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpufleet_events::EventPage;
use gpufleet_id::{EventId, InstanceId, ModelId, WorkerId};
use gpufleet_types::{
    HeartbeatReport, Model, ModelInstance, ModelSpec, ModelStatus, PlacementDecision, Reservation,
    Worker, WorkerHealth,
};

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    /// The spec changed and a new revision was stored.
    Revised,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub model: Model,
    pub outcome: ApplyOutcome,
}

/// A worker write, with the health it had before.
#[derive(Debug, Clone)]
pub struct WorkerChange {
    pub worker: Worker,
    /// `None` for a worker seen for the first time.
    pub previous: Option<WorkerHealth>,
}

impl WorkerChange {
    pub fn health_changed(&self) -> bool {
        self.previous != Some(self.worker.health)
    }
}

/// Durable source of truth for desired and observed state.
///
/// Every mutation that other components react to appends an event to the log
/// in the same transaction. Instance writes are optimistic: the caller passes
/// the record it read, and a version mismatch fails with
/// [`StoreError::Conflict`].
///
/// The reservation ledger is only extended through
/// [`commit_placement`](StateStore::commit_placement), which serializes per
/// worker and checks capacity before inserting. Reservations of an instance
/// disappear when its placement is cleared or the instance is deleted.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Creates the model, or stores a new revision when the spec differs from
    /// the current one. A model marked for deletion is revived.
    async fn apply_model(
        &self,
        spec: ModelSpec,
        now: DateTime<Utc>,
    ) -> Result<ApplyResult, StoreError>;

    async fn get_model(&self, id: ModelId) -> Result<Option<Model>, StoreError>;

    async fn get_model_by_name(&self, name: &str) -> Result<Option<Model>, StoreError>;

    async fn list_models(&self) -> Result<Vec<Model>, StoreError>;

    /// Spec of a specific revision; old revisions stay readable while
    /// instances created from them exist.
    async fn model_spec(
        &self,
        id: ModelId,
        revision: u64,
    ) -> Result<Option<ModelSpec>, StoreError>;

    async fn mark_model_deleting(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>, StoreError>;

    async fn update_model_status(
        &self,
        id: ModelId,
        status: &ModelStatus,
    ) -> Result<(), StoreError>;

    /// Removes a model marked for deletion once it has no instances left.
    async fn purge_model(&self, id: ModelId) -> Result<bool, StoreError>;

    /// Creates or refreshes the reporting worker. A heartbeat always brings
    /// the worker back to Ready (or Draining when it asks to drain).
    async fn record_heartbeat(
        &self,
        report: &HeartbeatReport,
        now: DateTime<Utc>,
    ) -> Result<WorkerChange, StoreError>;

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError>;

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;

    /// Returns the change when the health actually flipped.
    async fn set_worker_health(
        &self,
        id: WorkerId,
        health: WorkerHealth,
    ) -> Result<Option<WorkerChange>, StoreError>;

    /// Deletes a worker that holds no reservations.
    async fn remove_worker(&self, id: WorkerId) -> Result<bool, StoreError>;

    async fn create_instance(&self, instance: &ModelInstance) -> Result<ModelInstance, StoreError>;

    async fn get_instance(&self, id: InstanceId) -> Result<Option<ModelInstance>, StoreError>;

    /// All instances, or those of one model, oldest first.
    async fn list_instances(
        &self,
        model: Option<ModelId>,
    ) -> Result<Vec<ModelInstance>, StoreError>;

    /// Instances with any placement member on the worker.
    async fn instances_on_worker(
        &self,
        worker: WorkerId,
    ) -> Result<Vec<ModelInstance>, StoreError>;

    /// Writes `instance` if its version still matches and its state change is
    /// a legal transition. Returns the stored record with the bumped version.
    async fn update_instance(&self, instance: &ModelInstance)
        -> Result<ModelInstance, StoreError>;

    /// Atomically reserves every slice of the decision and moves the instance
    /// from Pending to Scheduled. Nothing is written if any slice does not
    /// fit.
    async fn commit_placement(
        &self,
        decision: &PlacementDecision,
        expected_version: i64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ModelInstance, StoreError>;

    /// Deletes the instance and releases its reservations.
    async fn delete_instance(&self, id: InstanceId) -> Result<bool, StoreError>;

    async fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError>;

    async fn events_after(&self, cursor: EventId, limit: u32) -> Result<EventPage, StoreError>;

    async fn latest_event_id(&self) -> Result<EventId, StoreError>;
}
