//! One reconciliation pass for one model.
//!
//! A pass reads the model, the fleet and the model's instances from the
//! store and then:
//!
//! 1. repairs instances by state (issue starts, expire stuck starts, restart
//!    or reschedule unhealthy replicas, finish terminations)
//! 2. plans the replica count with a rolling strategy and drains the surplus
//! 3. creates and schedules Pending replicas, honouring the model's backoff
//! 4. writes the model status and purges a deleted model once it is empty
//!
//! Every action keys on an instance id and is safe to repeat; a pass that
//! loses an optimistic write race simply asks to run again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gpufleet_id::{ModelId, WorkerId};
use gpufleet_reconcile::{
    select_for_drain, Backoff, DrainPriority, RollingStrategy, RolloutCounts,
};
use gpufleet_types::{
    Endpoint, FailureReason, GroupMembership, InstanceState, Model, ModelInstance, ModelPhase,
    ModelSpec, ModelStatus, Placement, StartBackendRequest, Worker, WorkerHealth,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::{after, elapsed, ControllerConfig};
use crate::agent_client::{AgentError, WorkerAgentClient};
use crate::db::{StateStore, StoreError};
use crate::scheduler::{Scheduler, WorkerView};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// State a model loop keeps between passes.
#[derive(Debug, Clone)]
pub struct ModelLoopState {
    backoff: Backoff,
    /// Scheduling is suspended until this instant after a NoFit or a failure.
    not_before: Option<DateTime<Utc>>,
}

impl ModelLoopState {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            backoff: Backoff::new(config.backoff_base, config.backoff_cap)
                .with_jitter(config.backoff_jitter),
            not_before: None,
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    fn arm(&mut self, now: DateTime<Utc>) -> Duration {
        let delay = self.backoff.next_delay();
        self.not_before = Some(after(now, delay));
        delay
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Run again after this long, sooner than the periodic tick.
    pub requeue_after: Option<Duration>,
    /// The model no longer exists; its loop should stop.
    pub gone: bool,
    pub created: u32,
    pub scheduled: u32,
    pub started: u32,
    pub terminated: u32,
}

impl ReconcileReport {
    fn requeue(&mut self, delay: Duration) {
        self.requeue_after = Some(match self.requeue_after {
            Some(current) => current.min(delay),
            None => delay,
        });
    }
}

struct Pass {
    model: Model,
    workers: HashMap<WorkerId, Worker>,
    now: DateTime<Utc>,
    report: ReconcileReport,
    /// Why the last scheduling attempt found no workers.
    no_fit: Option<String>,
    /// An instance reached Failed during this pass.
    failed: bool,
}

impl Pass {
    fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    /// Some member of the placement has no live worker behind it.
    fn is_lost(&self, instance: &ModelInstance) -> bool {
        instance.placement.as_ref().is_some_and(|p| {
            p.worker_ids().any(|id| {
                self.worker(id)
                    .is_none_or(|w| w.health == WorkerHealth::NotReady)
            })
        })
    }

    fn reservation_expired(&self, instance: &ModelInstance) -> bool {
        instance
            .reservation_expires_at
            .is_some_and(|at| at <= self.now)
    }
}

fn drain_priority(instance: &ModelInstance) -> DrainPriority {
    match instance.state {
        InstanceState::Unhealthy => DrainPriority::Unhealthy,
        InstanceState::Running => DrainPriority::Ready,
        _ => DrainPriority::NotReady,
    }
}

pub struct ModelReconciler {
    store: Arc<dyn StateStore>,
    agents: Arc<dyn WorkerAgentClient>,
    scheduler: Scheduler,
    config: ControllerConfig,
}

impl ModelReconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        agents: Arc<dyn WorkerAgentClient>,
        scheduler: Scheduler,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            agents,
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    #[instrument(skip(self, state, now), fields(model_id = %model_id))]
    pub async fn reconcile(
        &self,
        model_id: ModelId,
        state: &mut ModelLoopState,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let Some(model) = self.store.get_model(model_id).await? else {
            return Ok(ReconcileReport {
                gone: true,
                ..Default::default()
            });
        };
        let workers = self
            .store
            .list_workers()
            .await?
            .into_iter()
            .map(|w| (w.id, w))
            .collect();
        let mut pass = Pass {
            model,
            workers,
            now,
            report: ReconcileReport::default(),
            no_fit: None,
            failed: false,
        };

        for instance in self.store.list_instances(Some(model_id)).await? {
            self.repair(&mut pass, instance).await?;
        }
        if pass.failed {
            let delay = state.arm(now);
            pass.report.requeue(delay);
        }

        let instances = self.store.list_instances(Some(model_id)).await?;
        self.scale(&mut pass, instances).await?;

        self.schedule_pending(&mut pass, state).await?;
        self.write_status(&mut pass).await?;

        if pass.report != ReconcileReport::default() {
            debug!(report = ?pass.report, "Reconcile pass complete");
        }
        Ok(pass.report)
    }

    /// Turns races with other writers into a retry instead of an error.
    fn absorb<T>(
        &self,
        pass: &mut Pass,
        result: Result<T, StoreError>,
    ) -> Result<Option<T>, StoreError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(
                e @ (StoreError::Conflict(_)
                | StoreError::NotFound(_)
                | StoreError::InvalidTransition(_)),
            ) => {
                debug!(error = %e, "Lost a write race; retrying shortly");
                pass.report.requeue(self.config.conflict_retry);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn save(
        &self,
        pass: &mut Pass,
        instance: &ModelInstance,
    ) -> Result<Option<ModelInstance>, StoreError> {
        let result = self.store.update_instance(instance).await;
        self.absorb(pass, result)
    }

    async fn spec_for(&self, pass: &Pass, instance: &ModelInstance) -> Result<ModelSpec, StoreError> {
        if instance.revision == pass.model.revision {
            return Ok(pass.model.spec.clone());
        }
        Ok(self
            .store
            .model_spec(pass.model.id, instance.revision)
            .await?
            .unwrap_or_else(|| pass.model.spec.clone()))
    }

    // ---- phase 1: repair -------------------------------------------------

    async fn repair(&self, pass: &mut Pass, instance: ModelInstance) -> Result<(), StoreError> {
        match instance.state {
            InstanceState::Terminating => self.finish_termination(pass, instance).await,
            InstanceState::Pending | InstanceState::Failed => Ok(()),
            _ if pass.is_lost(&instance) => self.recover_lost(pass, instance).await,
            InstanceState::Scheduled | InstanceState::Starting
                if pass.reservation_expired(&instance) =>
            {
                self.start_failed(
                    pass,
                    instance,
                    FailureReason::StartTimeout,
                    "backend did not become ready before its reservation expired".to_string(),
                )
                .await
            }
            InstanceState::Scheduled if !instance.start_acknowledged => {
                self.start(pass, instance).await
            }
            InstanceState::Unhealthy => self.repair_unhealthy(pass, instance).await,
            InstanceState::Running if self.is_stable(pass, &instance) => {
                self.forgive(pass, instance).await
            }
            _ => Ok(()),
        }
    }

    /// Running long enough that earlier crashes no longer count against it.
    /// A Running record is only rewritten on a state change, so `updated_at`
    /// is when it last became Running.
    fn is_stable(&self, pass: &Pass, instance: &ModelInstance) -> bool {
        (instance.restart_count > 0 || instance.reschedule_count > 0)
            && elapsed(pass.now, instance.updated_at) >= self.config.stable_after
    }

    async fn forgive(&self, pass: &mut Pass, mut instance: ModelInstance) -> Result<(), StoreError> {
        debug!(
            instance_id = %instance.id,
            restarts = instance.restart_count,
            reschedules = instance.reschedule_count,
            "Instance stable; clearing repair counters"
        );
        instance.restart_count = 0;
        instance.reschedule_count = 0;
        self.save(pass, &instance).await?;
        Ok(())
    }

    /// Best-effort StopBackend on every live member.
    async fn stop_members(&self, pass: &Pass, instance: &ModelInstance) {
        let Some(placement) = &instance.placement else {
            return;
        };
        for worker_id in placement.worker_ids() {
            let Some(worker) = pass
                .worker(worker_id)
                .filter(|w| w.health != WorkerHealth::NotReady)
            else {
                continue;
            };
            if let Err(e) = self.agents.stop_backend(worker, instance.id).await {
                warn!(instance_id = %instance.id, %worker_id, error = %e, "StopBackend failed");
            }
        }
    }

    /// Sends StartBackend to every member, head first, and returns the
    /// head's endpoint.
    async fn issue_start(
        &self,
        pass: &Pass,
        instance: &ModelInstance,
        placement: &Placement,
        spec: &ModelSpec,
    ) -> Result<Endpoint, AgentError> {
        let unknown =
            |id: WorkerId| AgentError::Unreachable(format!("worker {id} is not registered"));
        let head = pass.worker(placement.head).ok_or_else(|| unknown(placement.head))?;
        let size = placement.members.len() as u32;

        let mut endpoint = None;
        for (rank, member) in placement.members.iter().enumerate() {
            let worker = pass
                .worker(member.worker_id)
                .ok_or_else(|| unknown(member.worker_id))?;
            let group = placement.is_multi_node().then(|| GroupMembership {
                head: placement.head,
                head_host: head.host().to_string(),
                rank: rank as u32,
                size,
            });
            let request = StartBackendRequest {
                instance_id: instance.id,
                model_id: instance.model_id,
                model_name: instance.model_name.clone(),
                revision: instance.revision,
                backend: spec.backend,
                source: spec.source.clone(),
                gpu_indexes: member.gpu_indexes.clone(),
                parallelism: spec.resources.parallelism,
                parameters: spec.backend_parameters.clone(),
                container: spec.container.clone(),
                group,
            };
            let response = self.agents.start_backend(worker, &request).await?;
            if member.worker_id == placement.head {
                endpoint = Some(response.endpoint);
            }
        }
        endpoint.ok_or_else(|| unknown(placement.head))
    }

    async fn start(&self, pass: &mut Pass, mut instance: ModelInstance) -> Result<(), StoreError> {
        let Some(placement) = instance.placement.clone() else {
            return Ok(());
        };
        let spec = self.spec_for(pass, &instance).await?;
        match self.issue_start(pass, &instance, &placement, &spec).await {
            Ok(endpoint) => {
                instance.start_acknowledged = true;
                instance.endpoint = Some(endpoint);
                instance.transition(InstanceState::Starting, pass.now)?;
                if self.save(pass, &instance).await?.is_some() {
                    info!(instance_id = %instance.id, worker_id = %placement.head, "Backend start acknowledged");
                    pass.report.started += 1;
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(instance_id = %instance.id, error = %e, "StartBackend not delivered; will retry");
                pass.report.requeue(self.config.backoff_base);
                Ok(())
            }
            Err(e) => {
                self.start_failed(pass, instance, FailureReason::BackendStartFailure, e.to_string())
                    .await
            }
        }
    }

    /// A start that will not succeed on this placement: release it and try
    /// elsewhere, or fail once the attempts are spent.
    async fn start_failed(
        &self,
        pass: &mut Pass,
        mut instance: ModelInstance,
        reason: FailureReason,
        message: String,
    ) -> Result<(), StoreError> {
        self.stop_members(pass, &instance).await;
        instance.start_attempts += 1;
        instance.fail(reason, message.clone(), pass.now);

        if instance.start_attempts >= self.config.max_start_attempts {
            instance.clear_placement();
            instance.transition(InstanceState::Failed, pass.now)?;
            warn!(instance_id = %instance.id, attempts = instance.start_attempts, %message, "Instance failed to start");
            pass.failed = true;
        } else {
            info!(instance_id = %instance.id, attempts = instance.start_attempts, %message, "Start failed; rescheduling");
            instance.unplace(true, pass.now)?;
        }
        self.save(pass, &instance).await?;
        Ok(())
    }

    /// The hosting worker is gone: move the replica elsewhere. Worker loss is
    /// not the replica's fault and does not use up its budget.
    async fn recover_lost(
        &self,
        pass: &mut Pass,
        mut instance: ModelInstance,
    ) -> Result<(), StoreError> {
        warn!(
            instance_id = %instance.id,
            worker_id = ?instance.worker_id(),
            state = %instance.state,
            "Worker lost; rescheduling instance"
        );
        self.stop_members(pass, &instance).await;
        instance.fail(
            FailureReason::WorkerLost,
            "worker stopped heartbeating",
            pass.now,
        );

        // Running cannot go straight back to Pending.
        if instance.state == InstanceState::Running {
            instance.transition(InstanceState::Unhealthy, pass.now)?;
            let Some(stored) = self.save(pass, &instance).await? else {
                return Ok(());
            };
            instance = stored;
        }
        instance.unplace(false, pass.now)?;
        self.save(pass, &instance).await?;
        Ok(())
    }

    async fn repair_unhealthy(
        &self,
        pass: &mut Pass,
        mut instance: ModelInstance,
    ) -> Result<(), StoreError> {
        let message = instance
            .failure
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| "backend unhealthy".to_string());
        if instance.restart_count >= self.config.max_restarts {
            return self.reschedule_or_fail(pass, instance, message).await;
        }
        let Some(placement) = instance.placement.clone() else {
            return Ok(());
        };

        self.stop_members(pass, &instance).await;
        let spec = self.spec_for(pass, &instance).await?;
        match self.issue_start(pass, &instance, &placement, &spec).await {
            Ok(endpoint) => {
                instance.restart_count += 1;
                instance.endpoint = Some(endpoint);
                instance.start_acknowledged = true;
                instance.reservation_expires_at =
                    Some(after(pass.now, self.config.reservation_timeout));
                instance.transition(InstanceState::Starting, pass.now)?;
                if self.save(pass, &instance).await?.is_some() {
                    info!(instance_id = %instance.id, restarts = instance.restart_count, "Restarted backend in place");
                    pass.report.started += 1;
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(instance_id = %instance.id, error = %e, "Restart not delivered; will retry");
                pass.report.requeue(self.config.backoff_base);
                Ok(())
            }
            Err(e) => self.reschedule_or_fail(pass, instance, e.to_string()).await,
        }
    }

    async fn reschedule_or_fail(
        &self,
        pass: &mut Pass,
        mut instance: ModelInstance,
        message: String,
    ) -> Result<(), StoreError> {
        self.stop_members(pass, &instance).await;
        if instance.reschedule_count < self.config.max_reschedules {
            let reason = instance
                .failure
                .as_ref()
                .map(|f| f.reason)
                .unwrap_or(FailureReason::HealthCheckFailed);
            instance.reschedule_count += 1;
            instance.restart_count = 0;
            instance.fail(reason, message, pass.now);
            instance.unplace(true, pass.now)?;
            info!(instance_id = %instance.id, reschedules = instance.reschedule_count, "Rescheduling unhealthy instance");
        } else {
            instance.fail(FailureReason::RestartsExhausted, message, pass.now);
            instance.clear_placement();
            instance.transition(InstanceState::Failed, pass.now)?;
            warn!(instance_id = %instance.id, "Restart and reschedule budget exhausted");
            pass.failed = true;
        }
        self.save(pass, &instance).await?;
        Ok(())
    }

    /// Deletes a Terminating record once nothing can still be running for it.
    async fn finish_termination(
        &self,
        pass: &mut Pass,
        instance: ModelInstance,
    ) -> Result<(), StoreError> {
        let head_gone = instance.worker_id().is_none_or(|id| {
            pass.worker(id)
                .is_none_or(|w| w.health == WorkerHealth::NotReady)
        });
        self.stop_members(pass, &instance).await;
        if instance.start_acknowledged && !head_gone {
            // Acknowledged: the worker's next heartbeat confirms the stop.
            return Ok(());
        }
        let result = self.store.delete_instance(instance.id).await;
        if self.absorb(pass, result)?.unwrap_or(false) {
            debug!(instance_id = %instance.id, "Terminated instance removed");
        }
        Ok(())
    }

    // ---- phase 2: plan and drain -----------------------------------------

    async fn terminate(&self, pass: &mut Pass, mut instance: ModelInstance) -> Result<(), StoreError> {
        pass.report.terminated += 1;
        if instance.state == InstanceState::Pending || !instance.start_acknowledged {
            // Nothing acknowledged on a worker yet, so nothing to wait for.
            self.stop_members(pass, &instance).await;
            let result = self.store.delete_instance(instance.id).await;
            self.absorb(pass, result)?;
            return Ok(());
        }
        instance.transition(InstanceState::Terminating, pass.now)?;
        if let Some(stored) = self.save(pass, &instance).await? {
            info!(instance_id = %stored.id, revision = stored.revision, "Terminating instance");
            self.stop_members(pass, &stored).await;
        }
        Ok(())
    }

    async fn scale(&self, pass: &mut Pass, instances: Vec<ModelInstance>) -> Result<(), StoreError> {
        let model = &pass.model;
        let desired = model.desired_replicas();
        let strategy = RollingStrategy {
            max_surge: model.spec.max_surge,
            max_unavailable: model.spec.max_unavailable,
        };

        let mut counts = RolloutCounts {
            desired,
            ..Default::default()
        };
        let mut current = Vec::new();
        let mut old_ready = Vec::new();
        let mut old_not_ready = Vec::new();
        let mut failed = Vec::new();
        let mut terminating_old = 0u32;
        for instance in instances {
            let is_current = instance.is_current(model);
            match instance.state {
                InstanceState::Terminating => {
                    if !is_current {
                        terminating_old += 1;
                    }
                }
                InstanceState::Failed => failed.push(instance),
                InstanceState::Running if is_current => {
                    counts.current_ready += 1;
                    current.push(instance);
                }
                _ if is_current => {
                    counts.current_not_ready += 1;
                    current.push(instance);
                }
                InstanceState::Running => {
                    counts.old_ready += 1;
                    old_ready.push(instance);
                }
                _ => {
                    counts.old_not_ready += 1;
                    old_not_ready.push(instance);
                }
            }
        }

        let mut plan = strategy.plan(counts);
        // Old replicas still shutting down hold their GPUs: they count
        // against the surge ceiling until the worker confirms the stop.
        let ceiling = desired.saturating_add(strategy.max_surge);
        let occupied = counts.total() - plan.drain_old_not_ready + terminating_old;
        plan.start = plan.start.min(ceiling.saturating_sub(occupied));
        if !plan.is_noop() {
            debug!(?counts, ?plan, terminating_old, "Rollout plan");
        }

        // Failed records explain a shortfall; once replacements are Running
        // they have nothing left to explain.
        let keep_failed = if model.deleting {
            0
        } else {
            desired.saturating_sub(counts.current_ready) as usize
        };
        let (current_failed, stale_failed): (Vec<_>, Vec<_>) =
            failed.into_iter().partition(|i| i.is_current(model));

        let drains = old_not_ready
            .into_iter()
            .take(plan.drain_old_not_ready as usize)
            .chain(
                select_for_drain(old_ready, drain_priority, |i| i.id)
                    .into_iter()
                    .take(plan.drain_old_ready as usize),
            )
            .chain(
                select_for_drain(current, drain_priority, |i| i.id)
                    .into_iter()
                    .take(plan.drain_current as usize),
            )
            .collect::<Vec<_>>();
        for instance in drains {
            self.terminate(pass, instance).await?;
        }

        let expired_failures = stale_failed.into_iter().chain(
            select_for_drain(current_failed, |_| DrainPriority::Ready, |i| i.id)
                .into_iter()
                .skip(keep_failed),
        );
        for instance in expired_failures {
            let result = self.store.delete_instance(instance.id).await;
            self.absorb(pass, result)?;
        }

        for _ in 0..plan.start {
            let instance = ModelInstance::pending(&pass.model, pass.now);
            let result = self.store.create_instance(&instance).await;
            if self.absorb(pass, result)?.is_some() {
                pass.report.created += 1;
            }
        }
        Ok(())
    }

    // ---- phase 3: schedule -----------------------------------------------

    async fn schedule_pending(
        &self,
        pass: &mut Pass,
        state: &mut ModelLoopState,
    ) -> Result<(), StoreError> {
        if pass.model.deleting {
            return Ok(());
        }
        let instances = self.store.list_instances(Some(pass.model.id)).await?;
        let pending: Vec<ModelInstance> = instances
            .iter()
            .filter(|i| i.state == InstanceState::Pending)
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        if let Some(not_before) = state.not_before.filter(|at| *at > pass.now) {
            let wait = (not_before - pass.now).to_std().unwrap_or_default();
            pass.report.requeue(wait);
            return Ok(());
        }

        if let Err(e) = pass.model.spec.validate() {
            for mut instance in pending {
                instance.fail(FailureReason::InvalidSpec, e.to_string(), pass.now);
                instance.transition(InstanceState::Failed, pass.now)?;
                self.save(pass, &instance).await?;
            }
            return Ok(());
        }

        let workers: Vec<Worker> = pass.workers.values().cloned().collect();
        let reservations = self.store.list_reservations().await?;
        let mut views = WorkerView::snapshot(workers, &reservations, &instances, pass.model.id);

        let spec = pass.model.spec.clone();
        let mut blocked = None;
        let mut placed_any = false;
        for instance in pending {
            let decision = match self.scheduler.schedule(&instance, &spec, &views) {
                Ok(decision) => decision,
                Err(e) => {
                    blocked = Some(e.to_string());
                    break;
                }
            };
            let expires_at = after(pass.now, self.config.reservation_timeout);
            let placed = match self
                .store
                .commit_placement(&decision, instance.version, expires_at, pass.now)
                .await
            {
                Ok(placed) => placed,
                Err(e) if e.is_retryable() => {
                    debug!(instance_id = %instance.id, error = %e, "Placement commit lost a race");
                    pass.report.requeue(self.config.conflict_retry);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for slice in &decision.slices {
                if let Some(view) = views.iter_mut().find(|v| v.worker.id == slice.worker_id) {
                    view.usage.add(slice);
                    view.siblings += 1;
                }
            }
            info!(
                instance_id = %placed.id,
                worker_id = ?decision.head(),
                score = decision.score,
                "Instance scheduled"
            );
            placed_any = true;
            pass.report.scheduled += 1;
            self.start(pass, placed).await?;
        }

        match blocked {
            Some(reason) => {
                let delay = state.arm(pass.now);
                info!(%reason, retry_in_ms = delay.as_millis() as u64, "No placement for pending instance");
                pass.report.requeue(delay);
                pass.no_fit = Some(reason);
            }
            None if placed_any && !pass.failed => {
                state.backoff.reset();
                state.not_before = None;
            }
            None => {}
        }
        Ok(())
    }

    // ---- phase 4: status -------------------------------------------------

    async fn write_status(&self, pass: &mut Pass) -> Result<(), StoreError> {
        let model = pass.model.clone();
        let instances = self.store.list_instances(Some(model.id)).await?;
        let desired = model.desired_replicas();
        let ready = instances
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .count() as u32;
        let active: Vec<&ModelInstance> =
            instances.iter().filter(|i| i.state.is_active()).collect();
        let latest_failure = instances
            .iter()
            .filter(|i| i.state == InstanceState::Failed && i.is_current(&model))
            .filter_map(|i| i.failure.as_ref())
            .max_by_key(|f| f.at);

        let (phase, message) = if model.deleting {
            (ModelPhase::Deleting, None)
        } else if let Some(reason) = &pass.no_fit {
            (ModelPhase::Unschedulable, Some(reason.clone()))
        } else if let Some(failure) = latest_failure.filter(|_| ready < desired) {
            (ModelPhase::Degraded, Some(failure.message.clone()))
        } else if ready >= desired
            && active.len() as u32 == desired
            && active
                .iter()
                .all(|i| i.state == InstanceState::Running && i.is_current(&model))
        {
            (ModelPhase::Ready, None)
        } else {
            (ModelPhase::Progressing, None)
        };

        let status = ModelStatus {
            phase,
            ready_replicas: ready,
            desired_replicas: desired,
            message,
            updated_at: Some(pass.now),
        };
        let changed = status.phase != model.status.phase
            || status.ready_replicas != model.status.ready_replicas
            || status.desired_replicas != model.status.desired_replicas
            || status.message != model.status.message;
        if changed {
            info!(phase = ?status.phase, ready, desired, "Model status changed");
            let result = self.store.update_model_status(model.id, &status).await;
            self.absorb(pass, result)?;
        }

        if model.deleting && instances.is_empty() && self.store.purge_model(model.id).await? {
            info!(model = %model.name(), "Model deleted");
            pass.report.gone = true;
        }
        Ok(())
    }
}
