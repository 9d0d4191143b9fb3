use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpufleet_events::{
    EventEnvelope, EventPage, EventPayload, InstanceDeletedPayload, ModelDeletedPayload,
    ModelRevisedPayload, NewEvent, WorkerHealthChangedPayload,
};
use gpufleet_id::{EventId, InstanceId, ModelId, WorkerId};
use gpufleet_types::{
    HeartbeatReport, InstanceState, Model, ModelInstance, ModelSpec, ModelStatus,
    PlacementDecision, Reservation, Usage, Worker, WorkerHealth,
};
use tokio::sync::RwLock;

use super::{
    instance_event, prepare_instance_update, template_hash, ApplyOutcome, ApplyResult,
    StateStore, StoreError, WorkerChange,
};

#[derive(Default)]
struct Inner {
    models: BTreeMap<ModelId, Model>,
    specs: BTreeMap<(ModelId, u64), ModelSpec>,
    workers: BTreeMap<WorkerId, Worker>,
    instances: BTreeMap<InstanceId, ModelInstance>,
    reservations: Vec<Reservation>,
    events: Vec<EventEnvelope>,
}

impl Inner {
    fn push_event(&mut self, event: NewEvent) {
        let id = EventId::new(self.events.len() as i64 + 1);
        self.events.push(event.into_envelope(id, Utc::now()));
    }

    fn push<P: EventPayload>(&mut self, payload: &P) -> Result<(), StoreError> {
        let event =
            NewEvent::from_payload(payload).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.push_event(event);
        Ok(())
    }

    fn sync_reservations(&mut self, instance: &ModelInstance) {
        if instance.placement.is_none() {
            self.reservations.retain(|r| r.instance_id != instance.id);
            return;
        }
        for r in self
            .reservations
            .iter_mut()
            .filter(|r| r.instance_id == instance.id)
        {
            r.expires_at = instance.reservation_expires_at;
        }
    }

    fn worker_change(
        &mut self,
        id: WorkerId,
        health: WorkerHealth,
    ) -> Result<Option<WorkerChange>, StoreError> {
        let Some(worker) = self.workers.get_mut(&id) else {
            return Ok(None);
        };
        if worker.health == health {
            return Ok(None);
        }
        let previous = worker.health;
        worker.health = health;
        let change = WorkerChange {
            worker: worker.clone(),
            previous: Some(previous),
        };
        self.push(&WorkerHealthChangedPayload {
            worker_id: id,
            name: change.worker.name.clone(),
            previous: Some(previous),
            health,
        })?;
        Ok(Some(change))
    }
}

/// Volatile [`StateStore`]. One lock guards everything, which also
/// serializes ledger updates for every worker.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn apply_model(
        &self,
        spec: ModelSpec,
        now: DateTime<Utc>,
    ) -> Result<ApplyResult, StoreError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .models
            .values()
            .find(|m| m.spec.name == spec.name)
            .cloned();

        let (model, outcome) = match existing {
            Some(mut model) if model.spec == spec => {
                let revived = model.deleting;
                model.deleting = false;
                model.updated_at = now;
                inner.models.insert(model.id, model.clone());
                let outcome = if revived {
                    ApplyOutcome::Revised
                } else {
                    ApplyOutcome::Unchanged
                };
                (model, outcome)
            }
            Some(mut model) => {
                model.revision += 1;
                model.template_hash = template_hash(&spec);
                model.spec = spec;
                model.deleting = false;
                model.updated_at = now;
                (model, ApplyOutcome::Revised)
            }
            None => {
                let model = Model {
                    id: ModelId::new(),
                    revision: 1,
                    template_hash: template_hash(&spec),
                    spec,
                    deleting: false,
                    status: ModelStatus::default(),
                    created_at: now,
                    updated_at: now,
                };
                (model, ApplyOutcome::Created)
            }
        };

        if outcome != ApplyOutcome::Unchanged {
            inner.models.insert(model.id, model.clone());
            inner
                .specs
                .insert((model.id, model.revision), model.spec.clone());
            inner.push(&ModelRevisedPayload {
                model_id: model.id,
                model_name: model.spec.name.clone(),
                revision: model.revision,
                replicas: model.spec.replicas,
            })?;
        }
        Ok(ApplyResult { model, outcome })
    }

    async fn get_model(&self, id: ModelId) -> Result<Option<Model>, StoreError> {
        Ok(self.inner.read().await.models.get(&id).cloned())
    }

    async fn get_model_by_name(&self, name: &str) -> Result<Option<Model>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .models
            .values()
            .find(|m| m.spec.name == name)
            .cloned())
    }

    async fn list_models(&self) -> Result<Vec<Model>, StoreError> {
        Ok(self.inner.read().await.models.values().cloned().collect())
    }

    async fn model_spec(
        &self,
        id: ModelId,
        revision: u64,
    ) -> Result<Option<ModelSpec>, StoreError> {
        Ok(self.inner.read().await.specs.get(&(id, revision)).cloned())
    }

    async fn mark_model_deleting(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(model) = inner.models.values_mut().find(|m| m.spec.name == name) else {
            return Ok(None);
        };
        model.deleting = true;
        model.updated_at = now;
        Ok(Some(model.clone()))
    }

    async fn update_model_status(
        &self,
        id: ModelId,
        status: &ModelStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let model = inner
            .models
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("model {id}")))?;
        model.status = status.clone();
        Ok(())
    }

    async fn purge_model(&self, id: ModelId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let deletable = inner.models.get(&id).is_some_and(|m| m.deleting)
            && !inner.instances.values().any(|i| i.model_id == id);
        if !deletable {
            return Ok(false);
        }
        let Some(model) = inner.models.remove(&id) else {
            return Ok(false);
        };
        inner.specs.retain(|(model_id, _), _| *model_id != id);
        inner.push(&ModelDeletedPayload {
            model_id: id,
            model_name: model.spec.name,
        })?;
        Ok(true)
    }

    async fn record_heartbeat(
        &self,
        report: &HeartbeatReport,
        now: DateTime<Utc>,
    ) -> Result<WorkerChange, StoreError> {
        let mut inner = self.inner.write().await;
        let health = if report.draining {
            WorkerHealth::Draining
        } else {
            WorkerHealth::Ready
        };

        let previous = inner.workers.get(&report.worker_id).map(|w| w.health);
        let created_at = inner
            .workers
            .get(&report.worker_id)
            .map(|w| w.created_at)
            .unwrap_or(now);
        let worker = Worker {
            id: report.worker_id,
            name: report.name.clone(),
            address: report.address.clone(),
            capacity: report.capacity.clone(),
            labels: report.labels.clone(),
            health,
            last_heartbeat_at: now,
            created_at,
        };
        inner.workers.insert(worker.id, worker.clone());

        let change = WorkerChange { worker, previous };
        if change.health_changed() {
            inner.push(&WorkerHealthChangedPayload {
                worker_id: change.worker.id,
                name: change.worker.name.clone(),
                previous,
                health,
            })?;
        }
        Ok(change)
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError> {
        Ok(self.inner.read().await.workers.get(&id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        Ok(self.inner.read().await.workers.values().cloned().collect())
    }

    async fn set_worker_health(
        &self,
        id: WorkerId,
        health: WorkerHealth,
    ) -> Result<Option<WorkerChange>, StoreError> {
        self.inner.write().await.worker_change(id, health)
    }

    async fn remove_worker(&self, id: WorkerId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.reservations.iter().any(|r| r.worker_id == id) {
            return Ok(false);
        }
        Ok(inner.workers.remove(&id).is_some())
    }

    async fn create_instance(&self, instance: &ModelInstance) -> Result<ModelInstance, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.instances.contains_key(&instance.id) {
            return Err(StoreError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        if !inner.models.contains_key(&instance.model_id) {
            return Err(StoreError::NotFound(format!("model {}", instance.model_id)));
        }
        let mut stored = instance.clone();
        stored.version = 1;
        if let Some(event) = instance_event(None, &stored)? {
            inner.push_event(event);
        }
        inner.instances.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<ModelInstance>, StoreError> {
        Ok(self.inner.read().await.instances.get(&id).cloned())
    }

    async fn list_instances(
        &self,
        model: Option<ModelId>,
    ) -> Result<Vec<ModelInstance>, StoreError> {
        // BTreeMap over ULIDs iterates oldest first.
        Ok(self
            .inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| model.is_none_or(|m| i.model_id == m))
            .cloned()
            .collect())
    }

    async fn instances_on_worker(
        &self,
        worker: WorkerId,
    ) -> Result<Vec<ModelInstance>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.is_on(worker))
            .cloned()
            .collect())
    }

    async fn update_instance(
        &self,
        instance: &ModelInstance,
    ) -> Result<ModelInstance, StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .instances
            .get(&instance.id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("instance {}", instance.id)))?;
        let out = prepare_instance_update(&stored, instance)?;

        if let Some(event) = instance_event(Some(&stored), &out)? {
            inner.push_event(event);
        }
        inner.sync_reservations(&out);
        inner.instances.insert(out.id, out.clone());
        Ok(out)
    }

    async fn commit_placement(
        &self,
        decision: &PlacementDecision,
        expected_version: i64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ModelInstance, StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .instances
            .get(&decision.instance_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("instance {}", decision.instance_id)))?;
        if stored.version != expected_version || stored.state != InstanceState::Pending {
            return Err(StoreError::Conflict(format!(
                "instance {} is no longer pending at version {expected_version}",
                stored.id
            )));
        }

        let mut seen = BTreeSet::new();
        for slice in &decision.slices {
            if !seen.insert(slice.worker_id) {
                return Err(StoreError::Conflict(format!(
                    "worker {} appears twice in one placement",
                    slice.worker_id
                )));
            }
            let worker = inner
                .workers
                .get(&slice.worker_id)
                .filter(|w| w.health == WorkerHealth::Ready)
                .ok_or(StoreError::WorkerUnavailable(slice.worker_id))?;
            let usage = Usage::from_reservations(
                inner
                    .reservations
                    .iter()
                    .filter(|r| r.worker_id == slice.worker_id),
            );
            usage
                .admit(&worker.capacity, slice)
                .map_err(|violation| StoreError::Capacity {
                    worker_id: slice.worker_id,
                    violation,
                })?;
        }

        let Some(placement) = decision.clone().into_placement() else {
            return Err(StoreError::Conflict("empty placement".to_string()));
        };
        let mut out = stored.clone();
        out.transition(InstanceState::Scheduled, now)?;
        out.placement = Some(placement);
        out.endpoint = None;
        out.start_acknowledged = false;
        out.reservation_expires_at = Some(expires_at);
        out.version += 1;

        for slice in &decision.slices {
            inner
                .reservations
                .push(Reservation::from_slice(out.id, slice, Some(expires_at)));
        }
        if let Some(event) = instance_event(Some(&stored), &out)? {
            inner.push_event(event);
        }
        inner.instances.insert(out.id, out.clone());
        Ok(out)
    }

    async fn delete_instance(&self, id: InstanceId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(instance) = inner.instances.remove(&id) else {
            return Ok(false);
        };
        inner.reservations.retain(|r| r.instance_id != id);
        inner.push(&InstanceDeletedPayload {
            instance_id: id,
            model_id: instance.model_id,
            model_name: instance.model_name,
        })?;
        Ok(true)
    }

    async fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.inner.read().await.reservations.clone())
    }

    async fn events_after(&self, cursor: EventId, limit: u32) -> Result<EventPage, StoreError> {
        let inner = self.inner.read().await;
        let events: Vec<EventEnvelope> = inner
            .events
            .iter()
            .filter(|e| e.event_id > cursor)
            .take(limit as usize)
            .cloned()
            .collect();
        let next_cursor = events.last().map(|e| e.event_id).unwrap_or(cursor);
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    async fn latest_event_id(&self) -> Result<EventId, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .events
            .last()
            .map(|e| e.event_id)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_types::{
        BackendKind, Capacity, GpuDevice, GpuVendor, PlacementConstraints, ResourceRequirements,
        WorkerSlice,
    };

    fn spec(name: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            source: "hf://org/model".to_string(),
            replicas: 1,
            resources: ResourceRequirements::gpus(1),
            placement: PlacementConstraints::default(),
            backend: BackendKind::Mock,
            backend_parameters: vec![],
            container: None,
            max_surge: 1,
            max_unavailable: 0,
        }
    }

    fn report(id: WorkerId, gpus: u32) -> HeartbeatReport {
        HeartbeatReport {
            worker_id: id,
            name: format!("w-{gpus}"),
            address: "http://127.0.0.1:9400".to_string(),
            capacity: Capacity {
                gpus: (0..gpus)
                    .map(|index| GpuDevice {
                        index,
                        class: "L4".to_string(),
                        vendor: GpuVendor::Nvidia,
                        memory_bytes: 24 << 30,
                    })
                    .collect(),
                cpu_millis: 8000,
                memory_bytes: 32 << 30,
            },
            labels: Default::default(),
            draining: false,
            instances: vec![],
        }
    }

    fn decision(instance: &ModelInstance, worker: WorkerId, gpu: u32) -> PlacementDecision {
        PlacementDecision {
            instance_id: instance.id,
            slices: vec![WorkerSlice {
                worker_id: worker,
                gpu_indexes: vec![gpu],
                memory_bytes: 0,
                cpu_millis: 0,
            }],
            score: 1.0,
        }
    }

    #[tokio::test]
    async fn apply_bumps_revision_only_on_change() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store.apply_model(spec("m"), now).await.unwrap();
        assert_eq!(first.outcome, ApplyOutcome::Created);
        assert_eq!(first.model.revision, 1);

        let again = store.apply_model(spec("m"), now).await.unwrap();
        assert_eq!(again.outcome, ApplyOutcome::Unchanged);
        assert_eq!(again.model.revision, 1);

        let mut scaled = spec("m");
        scaled.replicas = 3;
        let revised = store.apply_model(scaled, now).await.unwrap();
        assert_eq!(revised.outcome, ApplyOutcome::Revised);
        assert_eq!(revised.model.revision, 2);
        assert_eq!(revised.model.template_hash, first.model.template_hash);
        assert!(store.model_spec(first.model.id, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn commit_placement_rejects_double_booking() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let worker = WorkerId::new();
        store.record_heartbeat(&report(worker, 1), now).await.unwrap();
        let model = store.apply_model(spec("m"), now).await.unwrap().model;

        let a = store
            .create_instance(&ModelInstance::pending(&model, now))
            .await
            .unwrap();
        let b = store
            .create_instance(&ModelInstance::pending(&model, now))
            .await
            .unwrap();

        let placed = store
            .commit_placement(&decision(&a, worker, 0), a.version, now, now)
            .await
            .unwrap();
        assert_eq!(placed.state, InstanceState::Scheduled);

        let err = store
            .commit_placement(&decision(&b, worker, 0), b.version, now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Capacity { .. }));
        assert!(err.is_retryable());

        let b_now = store.get_instance(b.id).await.unwrap().unwrap();
        assert_eq!(b_now.state, InstanceState::Pending);
        assert_eq!(store.list_reservations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn multi_worker_commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (w1, w2) = (WorkerId::new(), WorkerId::new());
        store.record_heartbeat(&report(w1, 1), now).await.unwrap();
        store.record_heartbeat(&report(w2, 1), now).await.unwrap();
        let model = store.apply_model(spec("m"), now).await.unwrap().model;

        let blocker = store
            .create_instance(&ModelInstance::pending(&model, now))
            .await
            .unwrap();
        store
            .commit_placement(&decision(&blocker, w2, 0), blocker.version, now, now)
            .await
            .unwrap();

        let wide = store
            .create_instance(&ModelInstance::pending(&model, now))
            .await
            .unwrap();
        let mut joint = decision(&wide, w1, 0);
        joint.slices.push(WorkerSlice {
            worker_id: w2,
            gpu_indexes: vec![0],
            memory_bytes: 0,
            cpu_millis: 0,
        });
        assert!(store
            .commit_placement(&joint, wide.version, now, now)
            .await
            .is_err());

        let reservations = store.list_reservations().await.unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].instance_id, blocker.id);
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let model = store.apply_model(spec("m"), now).await.unwrap().model;
        let inst = store
            .create_instance(&ModelInstance::pending(&model, now))
            .await
            .unwrap();

        let mut first = inst.clone();
        first.transition(InstanceState::Terminating, now).unwrap();
        store.update_instance(&first).await.unwrap();

        let mut second = inst;
        second.transition(InstanceState::Failed, now).unwrap();
        assert!(matches!(
            store.update_instance(&second).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn terminating_cannot_return_to_running() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let model = store.apply_model(spec("m"), now).await.unwrap().model;
        let mut inst = store
            .create_instance(&ModelInstance::pending(&model, now))
            .await
            .unwrap();
        inst.state = InstanceState::Terminating;
        let inst = store.update_instance(&inst).await.unwrap();

        let mut back = inst.clone();
        back.state = InstanceState::Running;
        assert!(matches!(
            store.update_instance(&back).await,
            Err(StoreError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn clearing_placement_releases_reservations() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let worker = WorkerId::new();
        store.record_heartbeat(&report(worker, 1), now).await.unwrap();
        let model = store.apply_model(spec("m"), now).await.unwrap().model;
        let inst = store
            .create_instance(&ModelInstance::pending(&model, now))
            .await
            .unwrap();
        let mut placed = store
            .commit_placement(&decision(&inst, worker, 0), inst.version, now, now)
            .await
            .unwrap();

        placed.unplace(true, now).unwrap();
        store.update_instance(&placed).await.unwrap();
        assert!(store.list_reservations().await.unwrap().is_empty());
        assert!(store.remove_worker(worker).await.unwrap());
    }

    #[tokio::test]
    async fn event_log_pages_from_cursor() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.apply_model(spec("a"), now).await.unwrap();
        store.apply_model(spec("b"), now).await.unwrap();
        store.apply_model(spec("c"), now).await.unwrap();

        let page = store.events_after(EventId::new(1), 1).await.unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.next_cursor, EventId::new(2));
        assert_eq!(store.latest_event_id().await.unwrap(), EventId::new(3));

        let empty = store.events_after(EventId::new(3), 10).await.unwrap();
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_cursor, EventId::new(3));
    }

    #[tokio::test]
    async fn heartbeat_after_not_ready_restores_ready() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let worker = WorkerId::new();
        let first = store.record_heartbeat(&report(worker, 1), now).await.unwrap();
        assert!(first.health_changed());

        let flipped = store
            .set_worker_health(worker, WorkerHealth::NotReady)
            .await
            .unwrap();
        assert!(flipped.is_some());
        assert!(store
            .set_worker_health(worker, WorkerHealth::NotReady)
            .await
            .unwrap()
            .is_none());

        let back = store.record_heartbeat(&report(worker, 1), now).await.unwrap();
        assert_eq!(back.previous, Some(WorkerHealth::NotReady));
        assert_eq!(back.worker.health, WorkerHealth::Ready);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Whatever sequence of placements is attempted, the ledger never
            /// double-books a GPU or reserves one the worker does not have,
            /// and every free GPU that is asked for gets booked.
            #[test]
            fn ledger_never_overcommits(
                attempts in prop::collection::vec((0usize..2, 0u32..4, 0u64..12), 1..24),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let store = MemoryStore::new();
                    let now = Utc::now();
                    let workers = [WorkerId::new(), WorkerId::new()];
                    for w in workers {
                        store.record_heartbeat(&report(w, 2), now).await.unwrap();
                    }
                    let model = store.apply_model(spec("m"), now).await.unwrap().model;

                    let mut expected = BTreeSet::new();
                    let mut memory = [0u64; 2];
                    for (w, gpu, gib) in attempts {
                        let inst = store
                            .create_instance(&ModelInstance::pending(&model, now))
                            .await
                            .unwrap();
                        let mut d = decision(&inst, workers[w], gpu);
                        d.slices[0].memory_bytes = gib << 30;
                        let fits = gpu < 2
                            && !expected.contains(&(w, gpu))
                            && memory[w] + (gib << 30) <= 32 << 30;
                        let committed = store.commit_placement(&d, inst.version, now, now).await;
                        prop_assert_eq!(committed.is_ok(), fits);
                        if fits {
                            expected.insert((w, gpu));
                            memory[w] += gib << 30;
                        }
                    }

                    let reservations = store.list_reservations().await.unwrap();
                    prop_assert_eq!(reservations.len(), expected.len());
                    for (w, worker) in workers.iter().enumerate() {
                        let usage = Usage::from_reservations(
                            reservations.iter().filter(|r| r.worker_id == *worker),
                        );
                        prop_assert!(usage.memory_bytes <= 32 << 30);
                        prop_assert_eq!(usage.memory_bytes, memory[w]);
                        prop_assert!(usage.gpu_indexes.iter().all(|&g| g < 2));
                    }
                    Ok(())
                })?;
            }
        }
    }
}
