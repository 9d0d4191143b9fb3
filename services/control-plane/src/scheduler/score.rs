use gpufleet_types::{Affinity, ModelSpec, WorkerSlice};

use super::WorkerView;

/// Relative importance of each placement criterion. All components are in
/// `[0, 1]`, so the weights compare directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    /// Pack tightly: prefer workers left with the least free capacity.
    pub fragmentation: f64,
    /// Spread load: prefer workers with the least already reserved.
    pub load: f64,
    /// Prefer (or, with `Spread`, avoid) workers hosting a sibling replica.
    pub locality: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            fragmentation: 1.0,
            load: 0.0,
            locality: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub total: f64,
    /// Reserved fraction before placement; the first tie breaker.
    pub load: f64,
}

/// 1 minus the mean free fraction left on the worker once `slice` is added.
fn fragmentation(view: &WorkerView, slice: &WorkerSlice) -> f64 {
    let capacity = &view.worker.capacity;
    let mut after = view.usage.clone();
    after.add(slice);

    let mut free = Vec::with_capacity(2);
    if !capacity.gpus.is_empty() {
        let left = capacity.gpus.len().saturating_sub(after.gpu_indexes.len());
        free.push(left as f64 / capacity.gpus.len() as f64);
    }
    if capacity.memory_bytes > 0 {
        free.push(after.free_memory(capacity) as f64 / capacity.memory_bytes as f64);
    }
    if free.is_empty() {
        return 0.0;
    }
    1.0 - free.iter().sum::<f64>() / free.len() as f64
}

fn locality(view: &WorkerView, spec: &ModelSpec) -> f64 {
    let has_sibling = view.siblings > 0;
    match spec.placement.affinity {
        Affinity::Spread => f64::from(u8::from(!has_sibling)),
        Affinity::PreferColocate => f64::from(u8::from(has_sibling)),
        Affinity::None => {
            let wants = spec.backend.requires_colocation() && spec.resources.gpu_count > 1;
            f64::from(u8::from(wants && has_sibling))
        }
    }
}

pub fn score(
    view: &WorkerView,
    slice: &WorkerSlice,
    spec: &ModelSpec,
    weights: &ScoringWeights,
) -> Score {
    let load = view.usage.load(&view.worker.capacity);
    let total = weights.fragmentation * fragmentation(view, slice)
        + weights.load * (1.0 - load)
        + weights.locality * locality(view, spec);
    Score { total, load }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::filter::fit;
    use crate::scheduler::tests::{spec, view};

    #[test]
    fn fuller_worker_scores_higher_on_fragmentation() {
        let empty = view(4);
        let mut busy = view(4);
        busy.usage.gpu_indexes.extend([0, 1]);

        let s = spec(1);
        let w = ScoringWeights {
            fragmentation: 1.0,
            load: 0.0,
            locality: 0.0,
        };
        let a = score(&empty, &fit(&empty, &s, &[], 1).unwrap(), &s, &w);
        let b = score(&busy, &fit(&busy, &s, &[], 1).unwrap(), &s, &w);
        assert!(b.total > a.total);
        assert!(b.load > a.load);
    }

    #[test]
    fn load_weight_prefers_idle_worker() {
        let empty = view(4);
        let mut busy = view(4);
        busy.usage.gpu_indexes.insert(0);

        let s = spec(1);
        let w = ScoringWeights {
            fragmentation: 0.0,
            load: 1.0,
            locality: 0.0,
        };
        let a = score(&empty, &fit(&empty, &s, &[], 1).unwrap(), &s, &w);
        let b = score(&busy, &fit(&busy, &s, &[], 1).unwrap(), &s, &w);
        assert!(a.total > b.total);
    }

    #[test]
    fn spread_inverts_locality() {
        let mut with_sibling = view(2);
        with_sibling.siblings = 1;
        let without = view(2);

        let mut s = spec(1);
        s.placement.affinity = Affinity::PreferColocate;
        assert_eq!(locality(&with_sibling, &s), 1.0);
        assert_eq!(locality(&without, &s), 0.0);

        s.placement.affinity = Affinity::Spread;
        assert_eq!(locality(&with_sibling, &s), 0.0);
        assert_eq!(locality(&without, &s), 1.0);
    }
}
