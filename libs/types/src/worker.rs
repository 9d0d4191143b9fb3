//! Worker inventory and the per-worker reservation ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use gpufleet_id::{InstanceId, WorkerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::placement::WorkerSlice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Ascend,
    Apple,
    Other,
}

impl GpuVendor {
    /// Accelerator runtime the vendor's devices are driven through.
    pub fn device_type(&self) -> &'static str {
        match self {
            GpuVendor::Nvidia => "cuda",
            GpuVendor::Amd => "rocm",
            GpuVendor::Ascend => "npu",
            GpuVendor::Apple => "mps",
            GpuVendor::Other => "unknown",
        }
    }
}

impl FromStr for GpuVendor {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "nvidia" | "cuda" => GpuVendor::Nvidia,
            "amd" | "rocm" => GpuVendor::Amd,
            "ascend" | "huawei" | "npu" => GpuVendor::Ascend,
            "apple" | "mps" => GpuVendor::Apple,
            _ => GpuVendor::Other,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub index: u32,
    /// Compute class, e.g. `A100` or `RTX4090`.
    pub class: String,
    pub vendor: GpuVendor,
    pub memory_bytes: u64,
}

/// Resources a worker reports in its heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub gpus: Vec<GpuDevice>,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl Capacity {
    pub fn gpu(&self, index: u32) -> Option<&GpuDevice> {
        self.gpus.iter().find(|g| g.index == index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Ready,
    NotReady,
    /// Healthy but not accepting new placements.
    Draining,
}

impl WorkerHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerHealth::Ready => "ready",
            WorkerHealth::NotReady => "not_ready",
            WorkerHealth::Draining => "draining",
        }
    }
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerHealth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(WorkerHealth::Ready),
            "not_ready" => Ok(WorkerHealth::NotReady),
            "draining" => Ok(WorkerHealth::Draining),
            other => Err(format!("unknown worker health '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    /// Base URL of the worker agent RPC server.
    pub address: String,
    pub capacity: Capacity,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub health: WorkerHealth,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    /// Host part of the agent address; backends on this worker bind there.
    pub fn host(&self) -> &str {
        let without_scheme = self
            .address
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.address);
        let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
        authority
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(authority)
    }
}

/// Resources held on a worker for one instance.
///
/// `expires_at` is set while the instance is still coming up; a reservation
/// past its expiry is released by the controller. Running instances hold
/// reservations without expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub instance_id: InstanceId,
    pub worker_id: WorkerId,
    pub gpu_indexes: Vec<u32>,
    pub memory_bytes: u64,
    pub cpu_millis: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn from_slice(
        instance_id: InstanceId,
        slice: &WorkerSlice,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            instance_id,
            worker_id: slice.worker_id,
            gpu_indexes: slice.gpu_indexes.clone(),
            memory_bytes: slice.memory_bytes,
            cpu_millis: slice.cpu_millis,
            expires_at,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerViolation {
    #[error("gpu {0} does not exist on the worker")]
    UnknownGpu(u32),

    #[error("gpu {0} is already reserved")]
    GpuTaken(u32),

    #[error("memory over-commit: {requested} requested, {free} free")]
    Memory { requested: u64, free: u64 },

    #[error("cpu over-commit: {requested}m requested, {free}m free")]
    Cpu { requested: u64, free: u64 },
}

/// Sum of reservations held on one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub gpu_indexes: BTreeSet<u32>,
    pub memory_bytes: u64,
    pub cpu_millis: u64,
}

impl Usage {
    pub fn from_reservations<'a>(reservations: impl IntoIterator<Item = &'a Reservation>) -> Self {
        let mut usage = Usage::default();
        for r in reservations {
            usage.gpu_indexes.extend(r.gpu_indexes.iter().copied());
            usage.memory_bytes = usage.memory_bytes.saturating_add(r.memory_bytes);
            usage.cpu_millis = usage.cpu_millis.saturating_add(r.cpu_millis);
        }
        usage
    }

    pub fn free_memory(&self, capacity: &Capacity) -> u64 {
        capacity.memory_bytes.saturating_sub(self.memory_bytes)
    }

    pub fn free_cpu(&self, capacity: &Capacity) -> u64 {
        capacity.cpu_millis.saturating_sub(self.cpu_millis)
    }

    /// GPUs present in `capacity` that nobody holds yet.
    pub fn free_gpus<'a>(&'a self, capacity: &'a Capacity) -> impl Iterator<Item = &'a GpuDevice> {
        capacity
            .gpus
            .iter()
            .filter(move |g| !self.gpu_indexes.contains(&g.index))
    }

    /// Checks that `slice` can be added without over-committing the worker.
    ///
    /// Both stores call this under their per-worker lock before inserting a
    /// reservation, so the ledger never exceeds reported capacity.
    pub fn admit(&self, capacity: &Capacity, slice: &WorkerSlice) -> Result<(), LedgerViolation> {
        let mut seen = BTreeSet::new();
        for &idx in &slice.gpu_indexes {
            if capacity.gpu(idx).is_none() {
                return Err(LedgerViolation::UnknownGpu(idx));
            }
            if self.gpu_indexes.contains(&idx) || !seen.insert(idx) {
                return Err(LedgerViolation::GpuTaken(idx));
            }
        }
        let free = self.free_memory(capacity);
        if slice.memory_bytes > free {
            return Err(LedgerViolation::Memory {
                requested: slice.memory_bytes,
                free,
            });
        }
        let free = self.free_cpu(capacity);
        if slice.cpu_millis > free {
            return Err(LedgerViolation::Cpu {
                requested: slice.cpu_millis,
                free,
            });
        }
        Ok(())
    }

    pub fn add(&mut self, slice: &WorkerSlice) {
        self.gpu_indexes.extend(slice.gpu_indexes.iter().copied());
        self.memory_bytes = self.memory_bytes.saturating_add(slice.memory_bytes);
        self.cpu_millis = self.cpu_millis.saturating_add(slice.cpu_millis);
    }

    /// Fraction of the worker already reserved, averaged over GPU slots and
    /// memory. Dimensions the worker does not have are skipped.
    pub fn load(&self, capacity: &Capacity) -> f64 {
        let mut parts = Vec::with_capacity(2);
        if !capacity.gpus.is_empty() {
            parts.push(self.gpu_indexes.len() as f64 / capacity.gpus.len() as f64);
        }
        if capacity.memory_bytes > 0 {
            parts.push(self.memory_bytes as f64 / capacity.memory_bytes as f64);
        }
        if parts.is_empty() {
            0.0
        } else {
            parts.iter().sum::<f64>() / parts.len() as f64
        }
    }
}
