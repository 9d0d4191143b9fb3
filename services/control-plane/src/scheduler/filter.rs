//! Hard constraints a worker must satisfy to host a slice of an instance.

use std::fmt;

use gpufleet_id::WorkerId;
use gpufleet_types::{GpuDevice, ModelSpec, WorkerHealth, WorkerSlice};

use super::WorkerView;

/// Why a worker was filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rejection {
    NotReady,
    Excluded,
    LabelMismatch,
    InsufficientGpus,
    InsufficientMemory,
    InsufficientCpu,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::NotReady => "not_ready",
            Rejection::Excluded => "excluded",
            Rejection::LabelMismatch => "label_mismatch",
            Rejection::InsufficientGpus => "insufficient_gpus",
            Rejection::InsufficientMemory => "insufficient_memory",
            Rejection::InsufficientCpu => "insufficient_cpu",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn gpu_matches(gpu: &GpuDevice, class: Option<&str>, min_memory: u64) -> bool {
    let class_ok = class.is_none_or(|c| gpu.class.eq_ignore_ascii_case(c));
    class_ok && gpu.memory_bytes >= min_memory
}

/// Picks the slice `view` would contribute, or says why it cannot.
///
/// GPUs are chosen best-fit: the smallest matching VRAM first, then the
/// lowest index, so large cards stay free for large models.
pub fn fit(
    view: &WorkerView,
    spec: &ModelSpec,
    excluded: &[WorkerId],
    gpus_needed: u32,
) -> Result<WorkerSlice, Rejection> {
    let worker = &view.worker;
    if worker.health != WorkerHealth::Ready {
        return Err(Rejection::NotReady);
    }
    if excluded.contains(&worker.id) {
        return Err(Rejection::Excluded);
    }
    if !spec.placement.matches(&worker.labels) {
        return Err(Rejection::LabelMismatch);
    }

    let res = &spec.resources;
    let mut gpus: Vec<&GpuDevice> = view
        .usage
        .free_gpus(&worker.capacity)
        .filter(|g| gpu_matches(g, res.gpu_class.as_deref(), res.gpu_memory_bytes))
        .collect();
    if (gpus.len() as u32) < gpus_needed {
        return Err(Rejection::InsufficientGpus);
    }
    if view.usage.free_memory(&worker.capacity) < res.memory_bytes {
        return Err(Rejection::InsufficientMemory);
    }
    if view.usage.free_cpu(&worker.capacity) < res.cpu_millis {
        return Err(Rejection::InsufficientCpu);
    }

    gpus.sort_by_key(|g| (g.memory_bytes, g.index));
    let mut gpu_indexes: Vec<u32> = gpus
        .iter()
        .take(gpus_needed as usize)
        .map(|g| g.index)
        .collect();
    gpu_indexes.sort_unstable();

    Ok(WorkerSlice {
        worker_id: worker.id,
        gpu_indexes,
        memory_bytes: res.memory_bytes,
        cpu_millis: res.cpu_millis,
    })
}
