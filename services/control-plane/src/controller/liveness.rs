//! Worker liveness.
//!
//! A worker that misses heartbeats for longer than the grace period is probed
//! once; if the probe fails too, the worker becomes NotReady and every model
//! with an instance on it is reconciled so the instances move elsewhere.
//! NotReady workers that stay silent long enough and hold no reservations
//! are forgotten.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gpufleet_types::WorkerHealth;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{elapsed, HeartbeatProcessor, LivenessConfig, ReconcileTrigger};
use crate::agent_client::WorkerAgentClient;
use crate::db::{StateStore, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub probed: u32,
    pub marked_not_ready: u32,
    pub removed: u32,
}

pub struct LivenessMonitor {
    store: Arc<dyn StateStore>,
    agents: Arc<dyn WorkerAgentClient>,
    processor: Arc<HeartbeatProcessor>,
    trigger: ReconcileTrigger,
}

impl LivenessMonitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        agents: Arc<dyn WorkerAgentClient>,
        processor: Arc<HeartbeatProcessor>,
        trigger: ReconcileTrigger,
    ) -> Self {
        Self {
            store,
            agents,
            processor,
            trigger,
        }
    }

    fn config(&self) -> &LivenessConfig {
        self.processor.config()
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config().heartbeat_interval;
        info!(
            interval_secs = period.as_secs(),
            grace_secs = self.config().grace_period.as_secs(),
            "Starting liveness monitor"
        );

        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(stats) if stats != SweepStats::default() => {
                            info!(
                                probed = stats.probed,
                                marked_not_ready = stats.marked_not_ready,
                                removed = stats.removed,
                                "Liveness sweep complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Liveness sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Liveness monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats, StoreError> {
        let mut stats = SweepStats::default();
        let config = self.config().clone();

        for worker in self.store.list_workers().await? {
            let silent = elapsed(now, worker.last_heartbeat_at);

            if worker.health == WorkerHealth::NotReady {
                if silent >= config.removal_after && self.store.remove_worker(worker.id).await? {
                    info!(worker_id = %worker.id, name = %worker.name, "Removed long-silent worker");
                    stats.removed += 1;
                }
                continue;
            }
            if silent <= config.grace_period {
                continue;
            }

            stats.probed += 1;
            match self.agents.heartbeat(&worker).await {
                Ok(report) if report.worker_id == worker.id => {
                    debug!(worker_id = %worker.id, "Silent worker answered probe");
                    self.processor.ingest(&report, now).await?;
                    continue;
                }
                Ok(report) => {
                    warn!(
                        worker_id = %worker.id,
                        answered_by = %report.worker_id,
                        "Probe answered by a different worker"
                    );
                }
                Err(e) => debug!(worker_id = %worker.id, error = %e, "Liveness probe failed"),
            }

            if self
                .store
                .set_worker_health(worker.id, WorkerHealth::NotReady)
                .await?
                .is_some()
            {
                warn!(
                    worker_id = %worker.id,
                    name = %worker.name,
                    silent_secs = silent.as_secs(),
                    "Worker marked NotReady"
                );
                stats.marked_not_ready += 1;
                for instance in self.store.instances_on_worker(worker.id).await? {
                    self.trigger.notify(instance.model_id);
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{harness, spec};
    use gpufleet_types::InstanceState;

    #[tokio::test]
    async fn silent_worker_goes_not_ready_and_its_replica_moves() {
        let h = harness();
        let first = h.add_worker(1).await;
        let model = h.apply(spec("qwen", 1, 1)).await;
        h.reconcile(model.id).await;
        h.report_all_running().await;
        let inst = h.instances(model.id).await.remove(0);
        assert_eq!(inst.worker_id(), Some(first));

        let second = h.add_worker(1).await;
        h.agent.unreachable(first);

        // Within the grace period nothing happens.
        let soon = h.now + chrono::Duration::seconds(20);
        h.heartbeat_at(second, vec![], soon).await;
        let stats = h.liveness.sweep(soon).await.unwrap();
        assert_eq!(stats, SweepStats::default());
        let inst = h.instances(model.id).await.remove(0);
        assert_eq!(inst.state, InstanceState::Running);

        let late = h.now + chrono::Duration::seconds(45);
        h.heartbeat_at(second, vec![], late).await;
        let stats = h.liveness.sweep(late).await.unwrap();
        assert_eq!(stats.probed, 1);
        assert_eq!(stats.marked_not_ready, 1);
        let worker = h.store.get_worker(first).await.unwrap().unwrap();
        assert_eq!(worker.health, WorkerHealth::NotReady);

        h.reconcile_at(model.id, late).await;
        let inst = h.instances(model.id).await.remove(0);
        assert_eq!(inst.worker_id(), Some(second));
        assert_eq!(inst.reschedule_count, 0);
        assert!(inst.excluded_workers.is_empty());
        let on_first: Vec<_> = h
            .store
            .list_reservations()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.worker_id == first)
            .collect();
        assert!(on_first.is_empty());
    }

    #[tokio::test]
    async fn answering_probe_keeps_worker_ready() {
        let h = harness();
        let worker = h.add_worker(1).await;
        h.agent.set_report(h.report_for(worker, vec![]));

        let late = h.now + chrono::Duration::seconds(45);
        let stats = h.liveness.sweep(late).await.unwrap();
        assert_eq!(stats.probed, 1);
        assert_eq!(stats.marked_not_ready, 0);
        let stored = h.store.get_worker(worker).await.unwrap().unwrap();
        assert_eq!(stored.health, WorkerHealth::Ready);
        assert_eq!(stored.last_heartbeat_at, late);
    }

    #[tokio::test]
    async fn not_ready_worker_without_reservations_is_removed() {
        let h = harness();
        let worker = h.add_worker(1).await;
        h.agent.unreachable(worker);

        let late = h.now + chrono::Duration::seconds(45);
        h.liveness.sweep(late).await.unwrap();
        let much_later = h.now + chrono::Duration::hours(2);
        let stats = h.liveness.sweep(much_later).await.unwrap();
        assert_eq!(stats.removed, 1);
        assert!(h.store.get_worker(worker).await.unwrap().is_none());
    }
}
