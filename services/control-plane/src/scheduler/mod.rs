//! Placement of model instances onto workers.
//!
//! The scheduler is a pure function over a snapshot of the fleet: it filters
//! workers on hard constraints, scores the survivors and returns a joint
//! [`PlacementDecision`]. It never writes anything. The controller commits
//! the decision through [`StateStore::commit_placement`], which re-checks
//! the ledger under lock, so a stale snapshot can only cause a retry, never
//! an over-commit.
//!
//! [`StateStore::commit_placement`]: crate::db::StateStore::commit_placement

mod filter;
mod score;

pub use filter::Rejection;
pub use score::{Score, ScoringWeights};

use std::collections::BTreeMap;
use std::fmt;

use gpufleet_id::{ModelId, WorkerId};
use gpufleet_types::{
    ModelInstance, ModelSpec, PlacementDecision, Reservation, Usage, Worker, WorkerSlice,
};
use thiserror::Error;
use tracing::debug;

/// A worker as the scheduler sees it.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub worker: Worker,
    /// Sum of every reservation held on the worker.
    pub usage: Usage,
    /// Active replicas of the model being placed that already use the worker.
    pub siblings: u32,
}

impl WorkerView {
    /// Builds one view per worker for placing a replica of `model_id`.
    pub fn snapshot(
        workers: Vec<Worker>,
        reservations: &[Reservation],
        instances: &[ModelInstance],
        model_id: ModelId,
    ) -> Vec<WorkerView> {
        workers
            .into_iter()
            .map(|worker| {
                let usage = Usage::from_reservations(
                    reservations.iter().filter(|r| r.worker_id == worker.id),
                );
                let siblings = instances
                    .iter()
                    .filter(|i| i.model_id == model_id && i.state.is_active() && i.is_on(worker.id))
                    .count() as u32;
                WorkerView {
                    worker,
                    usage,
                    siblings,
                }
            })
            .collect()
    }
}

/// Per-reason rejection counts from one placement attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoFitReport {
    pub workers: usize,
    pub rejections: BTreeMap<Rejection, u32>,
}

impl fmt::Display for NoFitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.workers == 0 {
            return f.write_str("no workers registered");
        }
        write!(f, "0/{} workers fit", self.workers)?;
        let mut sep = ": ";
        for (reason, count) in &self.rejections {
            write!(f, "{sep}{count} {reason}")?;
            sep = ", ";
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    /// No worker satisfies the constraints right now.
    #[error("no fit: {0}")]
    NoFit(NoFitReport),

    /// A multi-worker replica found some, but not enough, workers.
    #[error("only {available} of {required} workers can host a member")]
    PartialPlacement { required: u32, available: u32 },
}

impl SchedulerError {
    /// Some worker was turned away only because the replica failed there.
    fn blocked_by_exclusion(&self) -> bool {
        match self {
            SchedulerError::NoFit(report) => report.rejections.contains_key(&Rejection::Excluded),
            SchedulerError::PartialPlacement { .. } => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    weights: ScoringWeights,
}

struct Candidate {
    slice: WorkerSlice,
    score: Score,
}

impl Scheduler {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Chooses workers for `instance`.
    ///
    /// Candidates are ranked by weighted score, then by lower load, then by
    /// worker id, so the same inputs always give the same answer. A replica
    /// spanning several workers takes the best `worker_span` distinct
    /// workers; the best one becomes the head.
    ///
    /// Workers the replica already failed on are avoided, but only while
    /// something else fits. When the excluded workers are the only ones
    /// left, they are tried again; the controller's attempt budget decides
    /// when to give up.
    pub fn schedule(
        &self,
        instance: &ModelInstance,
        spec: &ModelSpec,
        views: &[WorkerView],
    ) -> Result<PlacementDecision, SchedulerError> {
        match self.place(instance, spec, views, &instance.excluded_workers) {
            Err(e) if e.blocked_by_exclusion() => {
                debug!(instance_id = %instance.id, "Only excluded workers fit; trying them again");
                self.place(instance, spec, views, &[])
            }
            result => result,
        }
    }

    fn place(
        &self,
        instance: &ModelInstance,
        spec: &ModelSpec,
        views: &[WorkerView],
        excluded: &[WorkerId],
    ) -> Result<PlacementDecision, SchedulerError> {
        let span = spec.resources.worker_span.max(1);
        let per_worker = spec.resources.gpus_per_worker();

        let mut report = NoFitReport {
            workers: views.len(),
            ..Default::default()
        };
        let mut candidates = Vec::new();
        for view in views {
            match filter::fit(view, spec, excluded, per_worker) {
                Ok(slice) => {
                    let score = score::score(view, &slice, spec, &self.weights);
                    candidates.push(Candidate { slice, score });
                }
                Err(reason) => *report.rejections.entry(reason).or_default() += 1,
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .total
                .total_cmp(&a.score.total)
                .then(a.score.load.total_cmp(&b.score.load))
                .then(a.slice.worker_id.cmp(&b.slice.worker_id))
        });

        if candidates.is_empty() {
            debug!(instance_id = %instance.id, %report, "No worker fits");
            return Err(SchedulerError::NoFit(report));
        }
        if (candidates.len() as u32) < span {
            return Err(SchedulerError::PartialPlacement {
                required: span,
                available: candidates.len() as u32,
            });
        }

        candidates.truncate(span as usize);
        let score = candidates.iter().map(|c| c.score.total).sum::<f64>() / f64::from(span);
        Ok(PlacementDecision {
            instance_id: instance.id,
            slices: candidates.into_iter().map(|c| c.slice).collect(),
            score,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use gpufleet_types::{
        BackendKind, Capacity, GpuDevice, GpuVendor, Model, ModelStatus, PlacementConstraints,
        ResourceRequirements, WorkerHealth,
    };

    pub(crate) fn spec(gpus: u32) -> ModelSpec {
        ModelSpec {
            name: "qwen".into(),
            source: "hf://Qwen/Qwen2.5-7B".into(),
            replicas: 1,
            resources: ResourceRequirements::gpus(gpus),
            placement: PlacementConstraints::default(),
            backend: BackendKind::Mock,
            backend_parameters: vec![],
            container: None,
            max_surge: 1,
            max_unavailable: 0,
        }
    }

    pub(crate) fn view_with(gpus: &[(u32, &str, u64)]) -> WorkerView {
        let now = Utc::now();
        WorkerView {
            worker: Worker {
                id: WorkerId::new(),
                name: "gpu-node".into(),
                address: "http://10.0.0.1:9400".into(),
                capacity: Capacity {
                    gpus: gpus
                        .iter()
                        .map(|&(index, class, gib)| GpuDevice {
                            index,
                            class: class.into(),
                            vendor: GpuVendor::Nvidia,
                            memory_bytes: gib << 30,
                        })
                        .collect(),
                    cpu_millis: 16_000,
                    memory_bytes: 64 << 30,
                },
                labels: Default::default(),
                health: WorkerHealth::Ready,
                last_heartbeat_at: now,
                created_at: now,
            },
            usage: Usage::default(),
            siblings: 0,
        }
    }

    pub(crate) fn view(gpus: u32) -> WorkerView {
        let devices: Vec<(u32, &str, u64)> = (0..gpus).map(|i| (i, "L4", 24)).collect();
        view_with(&devices)
    }

    fn instance(spec: &ModelSpec) -> ModelInstance {
        let now = Utc::now();
        let model = Model {
            id: ModelId::new(),
            revision: 1,
            spec: spec.clone(),
            template_hash: "sha256:test".into(),
            deleting: false,
            status: ModelStatus::default(),
            created_at: now,
            updated_at: now,
        };
        ModelInstance::pending(&model, now)
    }

    #[test]
    fn two_replicas_land_on_two_single_gpu_workers() {
        let s = spec(1);
        let mut views = vec![view(1), view(1)];
        let scheduler = Scheduler::default();

        let first = scheduler.schedule(&instance(&s), &s, &views).unwrap();
        let head = first.head().unwrap();
        for v in views.iter_mut().filter(|v| v.worker.id == head) {
            v.usage.add(&first.slices[0]);
        }
        let second = scheduler.schedule(&instance(&s), &s, &views).unwrap();

        assert_ne!(second.head(), first.head());
    }

    #[test]
    fn no_free_gpu_is_no_fit_with_reasons() {
        let s = spec(1);
        let mut busy = view(1);
        busy.usage.gpu_indexes.insert(0);
        let mut down = view(1);
        down.worker.health = WorkerHealth::NotReady;

        let err = Scheduler::default()
            .schedule(&instance(&s), &s, &[busy, down])
            .unwrap_err();
        let SchedulerError::NoFit(report) = err else {
            panic!("expected NoFit, got {err:?}");
        };
        assert_eq!(report.rejections[&Rejection::InsufficientGpus], 1);
        assert_eq!(report.rejections[&Rejection::NotReady], 1);
        assert_eq!(
            report.to_string(),
            "0/2 workers fit: 1 not_ready, 1 insufficient_gpus"
        );
    }

    #[test]
    fn excluded_worker_is_avoided_while_another_fits() {
        let s = spec(1);
        let views = vec![view(1), view(1)];
        let mut inst = instance(&s);
        inst.excluded_workers.push(views[0].worker.id);

        let decision = Scheduler::default().schedule(&inst, &s, &views).unwrap();
        assert_eq!(decision.head(), Some(views[1].worker.id));
    }

    #[test]
    fn excluded_worker_is_reused_when_nothing_else_fits() {
        let s = spec(1);
        let only = view(1);
        let mut inst = instance(&s);
        inst.excluded_workers.push(only.worker.id);

        let decision = Scheduler::default()
            .schedule(&inst, &s, &[only.clone()])
            .unwrap();
        assert_eq!(decision.head(), Some(only.worker.id));
    }

    #[test]
    fn excluded_worker_without_room_still_reports_capacity() {
        let s = spec(1);
        let mut busy = view(1);
        busy.usage.gpu_indexes.insert(0);
        let mut inst = instance(&s);
        inst.excluded_workers.push(busy.worker.id);

        let err = Scheduler::default().schedule(&inst, &s, &[busy]).unwrap_err();
        let SchedulerError::NoFit(report) = err else {
            panic!("expected NoFit, got {err:?}");
        };
        assert_eq!(report.to_string(), "0/1 workers fit: 1 insufficient_gpus");
    }

    #[test]
    fn ties_break_on_worker_id() {
        let s = spec(1);
        let views = vec![view(2), view(2)];
        let lowest = views.iter().map(|v| v.worker.id).min().unwrap();

        let decision = Scheduler::default()
            .schedule(&instance(&s), &s, &views)
            .unwrap();
        assert_eq!(decision.head(), Some(lowest));
    }

    #[test]
    fn packs_onto_partially_used_worker() {
        let s = spec(1);
        let empty = view(2);
        let mut half = view(2);
        half.usage.gpu_indexes.insert(0);
        let half_id = half.worker.id;

        let decision = Scheduler::default()
            .schedule(&instance(&s), &s, &[empty, half])
            .unwrap();
        assert_eq!(decision.head(), Some(half_id));
        assert_eq!(decision.slices[0].gpu_indexes, vec![1]);
    }

    #[test]
    fn multi_node_takes_distinct_workers() {
        let mut s = spec(4);
        s.backend = BackendKind::Vllm;
        s.resources.worker_span = 2;
        let views = vec![view(2), view(2), view(1)];

        let decision = Scheduler::default()
            .schedule(&instance(&s), &s, &views)
            .unwrap();
        assert_eq!(decision.slices.len(), 2);
        assert_ne!(decision.slices[0].worker_id, decision.slices[1].worker_id);
        assert!(decision.slices.iter().all(|sl| sl.gpu_indexes.len() == 2));
    }

    #[test]
    fn multi_node_with_too_few_workers_is_partial() {
        let mut s = spec(4);
        s.backend = BackendKind::Vllm;
        s.resources.worker_span = 2;
        let views = vec![view(2), view(1)];

        let err = Scheduler::default()
            .schedule(&instance(&s), &s, &views)
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::PartialPlacement {
                required: 2,
                available: 1
            }
        );
    }

    #[test]
    fn snapshot_counts_siblings_and_usage() {
        let s = spec(1);
        let v = view(2);
        let mut sibling = instance(&s);
        let slice = WorkerSlice {
            worker_id: v.worker.id,
            gpu_indexes: vec![0],
            memory_bytes: 1 << 30,
            cpu_millis: 500,
        };
        sibling.state = gpufleet_types::InstanceState::Running;
        sibling.placement = Some(gpufleet_types::Placement {
            head: v.worker.id,
            members: vec![slice.clone()],
        });
        let reservation = Reservation::from_slice(sibling.id, &slice, None);

        let views = WorkerView::snapshot(
            vec![v.worker.clone()],
            &[reservation],
            &[sibling.clone()],
            sibling.model_id,
        );
        assert_eq!(views[0].siblings, 1);
        assert_eq!(views[0].usage.memory_bytes, 1 << 30);
        assert!(views[0].usage.gpu_indexes.contains(&0));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Placing replicas one after another, committing each decision,
            /// never hands out a GPU twice and fills every free GPU.
            #[test]
            fn sequential_placement_never_overcommits(
                fleet in prop::collection::vec(1u32..=4, 1..=5),
                gpus in 1u32..=2,
                replicas in 1usize..=12,
            ) {
                let s = spec(gpus);
                let mut views: Vec<WorkerView> = fleet.iter().map(|&n| view(n)).collect();
                let scheduler = Scheduler::default();
                let fits: usize = fleet.iter().map(|&n| (n / gpus) as usize).sum();

                let mut placed = 0;
                for _ in 0..replicas {
                    let Ok(decision) = scheduler.schedule(&instance(&s), &s, &views) else {
                        break;
                    };
                    for slice in &decision.slices {
                        let v = views
                            .iter_mut()
                            .find(|v| v.worker.id == slice.worker_id)
                            .unwrap();
                        for index in &slice.gpu_indexes {
                            prop_assert!(!v.usage.gpu_indexes.contains(index));
                            prop_assert!(v.worker.capacity.gpus.iter().any(|g| g.index == *index));
                        }
                        v.usage.add(slice);
                    }
                    placed += 1;
                }
                prop_assert_eq!(placed, replicas.min(fits));
            }
        }
    }
}
