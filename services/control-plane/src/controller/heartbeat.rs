//! Worker heartbeat ingestion.
//!
//! Heartbeats are the only source of observed backend state. Each report
//! refreshes the worker record, moves the instances it hosts to the state the
//! agent observed and tells the agent which backends it runs that the
//! control plane no longer knows about.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gpufleet_id::InstanceId;
use gpufleet_types::{
    FailureReason, HeartbeatAck, HeartbeatReport, InstanceState, ModelInstance, ReportedInstance,
    ReportedState,
};
use tracing::{debug, info, instrument};

use super::{elapsed, LivenessConfig, ReconcileTrigger};
use crate::db::{StateStore, StoreError};

pub struct HeartbeatProcessor {
    store: Arc<dyn StateStore>,
    trigger: ReconcileTrigger,
    config: LivenessConfig,
}

impl HeartbeatProcessor {
    pub fn new(store: Arc<dyn StateStore>, trigger: ReconcileTrigger, config: LivenessConfig) -> Self {
        Self {
            store,
            trigger,
            config,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    #[instrument(skip(self, report, now), fields(worker_id = %report.worker_id, instances = report.instances.len()))]
    pub async fn ingest(
        &self,
        report: &HeartbeatReport,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatAck, StoreError> {
        let change = self.store.record_heartbeat(report, now).await?;
        if change.health_changed() {
            info!(
                name = %change.worker.name,
                previous = ?change.previous,
                health = %change.worker.health,
                "Worker health changed"
            );
        }

        let worker_id = report.worker_id;
        let reported: HashMap<InstanceId, &ReportedInstance> = report
            .instances
            .iter()
            .map(|r| (r.instance_id, r))
            .collect();
        let placed = self.store.instances_on_worker(worker_id).await?;

        let mut touched = BTreeSet::new();
        for instance in &placed {
            if change.health_changed() {
                touched.insert(instance.model_id);
            }
            // Members of a multi-worker group follow their head.
            if instance.worker_id() != Some(worker_id) {
                continue;
            }
            let outcome = match reported.get(&instance.id) {
                Some(observed) => self.apply_report(instance, observed, now).await,
                None => self.apply_missing(instance, now).await,
            };
            match outcome {
                Ok(true) => {
                    touched.insert(instance.model_id);
                }
                Ok(false) => {}
                Err(
                    e @ (StoreError::Conflict(_)
                    | StoreError::NotFound(_)
                    | StoreError::InvalidTransition(_)),
                ) => {
                    debug!(instance_id = %instance.id, error = %e, "Skipped stale observation");
                    touched.insert(instance.model_id);
                }
                Err(e) => return Err(e),
            }
        }

        let stop_instances: Vec<InstanceId> = report
            .instances
            .iter()
            .map(|r| r.instance_id)
            .filter(|id| !placed.iter().any(|i| i.id == *id))
            .collect();
        if !stop_instances.is_empty() {
            info!(count = stop_instances.len(), "Asking worker to stop unknown backends");
        }

        for model_id in touched {
            self.trigger.notify(model_id);
        }

        Ok(HeartbeatAck {
            accepted: true,
            next_heartbeat_secs: self.config.heartbeat_interval.as_secs().max(1),
            stop_instances,
        })
    }

    /// Returns whether the instance changed.
    async fn apply_report(
        &self,
        instance: &ModelInstance,
        observed: &ReportedInstance,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if instance.state == InstanceState::Terminating {
            if observed.state == ReportedState::Exited {
                return self.store.delete_instance(instance.id).await;
            }
            return Ok(false);
        }
        if !instance.state.is_placed() {
            return Ok(false);
        }

        let mut next = instance.clone();
        // A report proves the start arrived even if the response was lost.
        next.start_acknowledged = true;
        match observed.state {
            ReportedState::Starting => {
                if next.state == InstanceState::Scheduled {
                    next.transition(InstanceState::Starting, now)?;
                }
            }
            ReportedState::Running => {
                next.transition(InstanceState::Running, now)?;
                if let Some(endpoint) = &observed.endpoint {
                    next.endpoint = Some(endpoint.clone());
                }
                next.reservation_expires_at = None;
                next.failure = None;
            }
            ReportedState::Unhealthy => {
                if next.state != InstanceState::Unhealthy {
                    let message = observed
                        .message
                        .clone()
                        .unwrap_or_else(|| "health check failed".to_string());
                    next.fail(FailureReason::HealthCheckFailed, message, now);
                    next.transition(InstanceState::Unhealthy, now)?;
                }
            }
            ReportedState::Exited => {
                if next.state != InstanceState::Unhealthy {
                    let message = match (&observed.message, observed.exit_code) {
                        (Some(m), Some(code)) => format!("backend exited with code {code}: {m}"),
                        (Some(m), None) => m.clone(),
                        (None, Some(code)) => format!("backend exited with code {code}"),
                        (None, None) => "backend exited".to_string(),
                    };
                    next.fail(FailureReason::ProcessExited, message, now);
                    next.transition(InstanceState::Unhealthy, now)?;
                }
            }
        }

        let state_changed = next.state != instance.state;
        next.updated_at = instance.updated_at;
        if next == *instance {
            return Ok(false);
        }
        if state_changed {
            next.updated_at = now;
        }
        let stored = self.store.update_instance(&next).await?;
        if state_changed {
            info!(
                instance_id = %stored.id,
                from = %instance.state,
                to = %stored.state,
                "Instance state observed"
            );
        }
        Ok(true)
    }

    async fn apply_missing(
        &self,
        instance: &ModelInstance,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match instance.state {
            // Not on the worker any more: the stop went through.
            InstanceState::Terminating => self.store.delete_instance(instance.id).await,
            InstanceState::Starting | InstanceState::Running
                if instance.start_acknowledged
                    && elapsed(now, instance.updated_at) > self.config.missing_report_grace =>
            {
                let mut next = instance.clone();
                next.fail(
                    FailureReason::ProcessExited,
                    "backend missing from worker report",
                    now,
                );
                next.transition(InstanceState::Unhealthy, now)?;
                self.store.update_instance(&next).await?;
                info!(instance_id = %instance.id, "Acknowledged backend disappeared from worker");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{harness, spec};
    use gpufleet_types::{Endpoint, WorkerHealth};

    fn observed(id: InstanceId, state: ReportedState) -> ReportedInstance {
        ReportedInstance {
            instance_id: id,
            state,
            endpoint: Some(Endpoint::new("10.0.0.1", 40001)),
            exit_code: None,
            message: None,
        }
    }

    #[tokio::test]
    async fn first_heartbeat_registers_a_ready_worker() {
        let h = harness();
        let id = h.add_worker(2).await;
        let worker = h.store.get_worker(id).await.unwrap().unwrap();
        assert_eq!(worker.health, WorkerHealth::Ready);
        assert_eq!(worker.capacity.gpus.len(), 2);
    }

    #[tokio::test]
    async fn running_report_clears_reservation_expiry() {
        let h = harness();
        let worker = h.add_worker(1).await;
        let model = h.apply(spec("qwen", 1, 1)).await;
        h.reconcile(model.id).await;
        let inst = h.instances(model.id).await.remove(0);
        assert!(inst.reservation_expires_at.is_some());

        let ack = h
            .heartbeat(worker, vec![observed(inst.id, ReportedState::Running)])
            .await;
        assert!(ack.accepted);
        assert!(ack.stop_instances.is_empty());

        let inst = h.instances(model.id).await.remove(0);
        assert_eq!(inst.state, InstanceState::Running);
        assert_eq!(inst.reservation_expires_at, None);
        assert_eq!(inst.endpoint, Some(Endpoint::new("10.0.0.1", 40001)));
        let reservations = h.store.list_reservations().await.unwrap();
        assert!(reservations.iter().all(|r| r.expires_at.is_none()));
    }

    #[tokio::test]
    async fn unknown_backends_are_returned_for_stopping() {
        let h = harness();
        let worker = h.add_worker(1).await;
        let stray = InstanceId::new();
        let ack = h
            .heartbeat(worker, vec![observed(stray, ReportedState::Running)])
            .await;
        assert_eq!(ack.stop_instances, vec![stray]);
    }

    #[tokio::test]
    async fn repeated_running_report_is_a_no_op() {
        let h = harness();
        let worker = h.add_worker(1).await;
        let model = h.apply(spec("qwen", 1, 1)).await;
        h.reconcile(model.id).await;
        let inst = h.instances(model.id).await.remove(0);

        h.heartbeat(worker, vec![observed(inst.id, ReportedState::Running)])
            .await;
        let first = h.instances(model.id).await.remove(0);
        h.heartbeat(worker, vec![observed(inst.id, ReportedState::Running)])
            .await;
        let second = h.instances(model.id).await.remove(0);
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn exit_marks_instance_unhealthy_with_exit_code() {
        let h = harness();
        let worker = h.add_worker(1).await;
        let model = h.apply(spec("qwen", 1, 1)).await;
        h.reconcile(model.id).await;
        let inst = h.instances(model.id).await.remove(0);

        let mut exited = observed(inst.id, ReportedState::Exited);
        exited.exit_code = Some(137);
        h.heartbeat(worker, vec![exited]).await;

        let inst = h.instances(model.id).await.remove(0);
        assert_eq!(inst.state, InstanceState::Unhealthy);
        let failure = inst.failure.unwrap();
        assert_eq!(failure.reason, FailureReason::ProcessExited);
        assert!(failure.message.contains("137"));
    }

    #[tokio::test]
    async fn acknowledged_backend_missing_past_grace_is_unhealthy() {
        let h = harness();
        let worker = h.add_worker(1).await;
        let model = h.apply(spec("qwen", 1, 1)).await;
        h.reconcile(model.id).await;

        h.heartbeat(worker, vec![]).await;
        let inst = h.instances(model.id).await.remove(0);
        assert_eq!(inst.state, InstanceState::Starting);

        let later = h.now + chrono::Duration::minutes(2);
        h.heartbeat_at(worker, vec![], later).await;
        let inst = h.instances(model.id).await.remove(0);
        assert_eq!(inst.state, InstanceState::Unhealthy);
    }
}
