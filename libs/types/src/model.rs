//! Desired state for a served model.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use gpufleet_id::ModelId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inference engine family that serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// llama.cpp-family server binary.
    LlamaBox,
    /// Python serving engine with tensor/pipeline parallelism.
    Vllm,
    /// Arbitrary container started with `docker run`.
    Docker,
    /// In-process HTTP backend used for development and tests.
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LlamaBox => "llama_box",
            BackendKind::Vllm => "vllm",
            BackendKind::Docker => "docker",
            BackendKind::Mock => "mock",
        }
    }

    /// Whether one replica may span several workers.
    pub fn supports_multi_node(&self) -> bool {
        matches!(self, BackendKind::Vllm)
    }

    /// Whether the engine's multi-GPU parallelism wants replicas packed
    /// together with their siblings.
    pub fn requires_colocation(&self) -> bool {
        matches!(self, BackendKind::LlamaBox | BackendKind::Vllm)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llama_box" => Ok(BackendKind::LlamaBox),
            "vllm" => Ok(BackendKind::Vllm),
            "docker" => Ok(BackendKind::Docker),
            "mock" => Ok(BackendKind::Mock),
            other => Err(SpecError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parallelism {
    pub tensor: u32,
    pub pipeline: u32,
}

impl Default for Parallelism {
    fn default() -> Self {
        Self {
            tensor: 1,
            pipeline: 1,
        }
    }
}

impl Parallelism {
    pub fn degree(&self) -> u32 {
        self.tensor.saturating_mul(self.pipeline)
    }
}

/// Per-replica resource request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// GPUs for the whole replica, summed over every worker it spans.
    pub gpu_count: u32,
    /// Required GPU class, e.g. `A100`. `None` accepts any class.
    #[serde(default)]
    pub gpu_class: Option<String>,
    /// Minimum VRAM of every selected GPU.
    #[serde(default)]
    pub gpu_memory_bytes: u64,
    /// Host memory reserved on each spanned worker.
    #[serde(default)]
    pub memory_bytes: u64,
    /// Host CPU reserved on each spanned worker.
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub parallelism: Parallelism,
    /// Number of workers one replica spans.
    #[serde(default = "default_worker_span")]
    pub worker_span: u32,
}

fn default_worker_span() -> u32 {
    1
}

impl ResourceRequirements {
    pub fn gpus(count: u32) -> Self {
        Self {
            gpu_count: count,
            gpu_class: None,
            gpu_memory_bytes: 0,
            memory_bytes: 0,
            cpu_millis: 0,
            parallelism: Parallelism::default(),
            worker_span: 1,
        }
    }

    pub fn is_multi_node(&self) -> bool {
        self.worker_span > 1
    }

    /// GPUs each spanned worker must contribute.
    pub fn gpus_per_worker(&self) -> u32 {
        self.gpu_count / self.worker_span.max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    #[default]
    None,
    /// Prefer workers already hosting a replica of the same model.
    PreferColocate,
    /// Prefer workers that do not host a replica of the same model yet.
    Spread,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConstraints {
    /// Every pair must be present in the worker's labels.
    #[serde(default)]
    pub worker_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub affinity: Affinity,
}

impl PlacementConstraints {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.worker_selector
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Container launch description for [`BackendKind::Docker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    /// Port the server listens on inside the container.
    #[serde(default = "default_container_port")]
    pub container_port: u16,
}

fn default_container_port() -> u16 {
    8080
}

/// Desired state of one model revision. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Client-facing identifier used for routing.
    pub name: String,
    /// Artifact reference: hub repository, local path, image.
    pub source: String,
    pub replicas: u32,
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub placement: PlacementConstraints,
    pub backend: BackendKind,
    /// Extra engine arguments appended to the launch command.
    #[serde(default)]
    pub backend_parameters: Vec<String>,
    #[serde(default)]
    pub container: Option<ContainerSpec>,
    /// Extra replicas allowed above `replicas` during a rolling update.
    #[serde(default = "default_max_surge")]
    pub max_surge: u32,
    /// Replicas allowed below `replicas` during a rolling update.
    #[serde(default)]
    pub max_unavailable: u32,
}

fn default_max_surge() -> u32 {
    1
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("model name must be non-empty and contain only [a-zA-Z0-9._/-:]")]
    InvalidName,

    #[error("model source must not be empty")]
    EmptySource,

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("worker_span must be at least 1")]
    ZeroWorkerSpan,

    #[error("gpu_count {gpu_count} is not divisible across {worker_span} workers")]
    UnevenSpan { gpu_count: u32, worker_span: u32 },

    #[error("backend {0} cannot span multiple workers")]
    MultiNodeUnsupported(BackendKind),

    #[error("parallelism degree {degree} does not match gpu_count {gpu_count}")]
    ParallelismMismatch { degree: u32, gpu_count: u32 },

    #[error("docker backend requires a container spec")]
    MissingContainer,

    #[error("max_surge and max_unavailable cannot both be zero")]
    StalledRollout,
}

impl ModelSpec {
    /// Checks the spec for errors that no amount of retrying would fix.
    pub fn validate(&self) -> Result<(), SpecError> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "._/-:".contains(c));
        if !name_ok {
            return Err(SpecError::InvalidName);
        }
        if self.source.trim().is_empty() {
            return Err(SpecError::EmptySource);
        }

        let res = &self.resources;
        if res.worker_span == 0 {
            return Err(SpecError::ZeroWorkerSpan);
        }
        if res.gpu_count % res.worker_span != 0 {
            return Err(SpecError::UnevenSpan {
                gpu_count: res.gpu_count,
                worker_span: res.worker_span,
            });
        }
        if res.is_multi_node() && !self.backend.supports_multi_node() {
            return Err(SpecError::MultiNodeUnsupported(self.backend));
        }
        let degree = res.parallelism.degree();
        if degree > 1 && degree != res.gpu_count {
            return Err(SpecError::ParallelismMismatch {
                degree,
                gpu_count: res.gpu_count,
            });
        }
        if self.backend == BackendKind::Docker && self.container.is_none() {
            return Err(SpecError::MissingContainer);
        }
        if self.max_surge == 0 && self.max_unavailable == 0 && self.replicas > 0 {
            return Err(SpecError::StalledRollout);
        }
        Ok(())
    }

    /// The parts of the spec that shape a replica. Changing anything here
    /// requires replacing running instances; `replicas`, `max_surge` and
    /// `max_unavailable` only change how many there are.
    pub fn template(&self) -> serde_json::Value {
        serde_json::json!({
            "source": self.source,
            "resources": self.resources,
            "placement": self.placement,
            "backend": self.backend,
            "backend_parameters": self.backend_parameters,
            "container": self.container,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase {
    #[default]
    Pending,
    /// Replicas are being created, replaced or repaired.
    Progressing,
    Ready,
    /// Some replicas failed permanently.
    Degraded,
    /// At least one replica cannot be placed on the current fleet.
    Unschedulable,
    Deleting,
}

/// Observed model status, written by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub phase: ModelPhase,
    pub ready_replicas: u32,
    pub desired_replicas: u32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A model and its current revision as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub revision: u64,
    pub spec: ModelSpec,
    /// Hash of [`ModelSpec::template`] for the current revision.
    pub template_hash: String,
    pub deleting: bool,
    pub status: ModelStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn desired_replicas(&self) -> u32 {
        if self.deleting {
            0
        } else {
            self.spec.replicas
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rstest::rstest;

    pub(crate) fn spec(name: &str, gpus: u32) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            source: "hf://Qwen/Qwen2.5-0.5B-Instruct".to_string(),
            replicas: 1,
            resources: ResourceRequirements::gpus(gpus),
            placement: PlacementConstraints::default(),
            backend: BackendKind::Vllm,
            backend_parameters: vec![],
            container: None,
            max_surge: 1,
            max_unavailable: 0,
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert_eq!(spec("qwen", 1).validate(), Ok(()));
    }

    #[rstest]
    #[case("", SpecError::InvalidName)]
    #[case("has space", SpecError::InvalidName)]
    fn rejects_bad_names(#[case] name: &str, #[case] expected: SpecError) {
        assert_eq!(spec(name, 1).validate(), Err(expected));
    }

    #[test]
    fn multi_node_requires_capable_backend() {
        let mut s = spec("big", 4);
        s.resources.worker_span = 2;
        assert_eq!(s.validate(), Ok(()));

        s.backend = BackendKind::LlamaBox;
        assert_eq!(
            s.validate(),
            Err(SpecError::MultiNodeUnsupported(BackendKind::LlamaBox))
        );
    }

    #[test]
    fn span_must_divide_gpu_count() {
        let mut s = spec("odd", 3);
        s.resources.worker_span = 2;
        assert!(matches!(s.validate(), Err(SpecError::UnevenSpan { .. })));
    }

    #[test]
    fn parallelism_must_cover_all_gpus() {
        let mut s = spec("tp", 4);
        s.resources.parallelism = Parallelism {
            tensor: 2,
            pipeline: 1,
        };
        assert!(matches!(
            s.validate(),
            Err(SpecError::ParallelismMismatch { .. })
        ));
        s.resources.parallelism.pipeline = 2;
        assert_eq!(s.validate(), Ok(()));
    }

    #[test]
    fn docker_needs_container() {
        let mut s = spec("c", 1);
        s.backend = BackendKind::Docker;
        assert_eq!(s.validate(), Err(SpecError::MissingContainer));
    }

    #[test]
    fn template_ignores_replica_count() {
        let a = spec("m", 1);
        let mut b = a.clone();
        b.replicas = 7;
        b.max_surge = 3;
        assert_eq!(a.template(), b.template());

        b.backend_parameters.push("--max-model-len=4096".into());
        assert_ne!(a.template(), b.template());
    }

    #[test]
    fn selector_requires_every_label() {
        let mut constraints = PlacementConstraints::default();
        constraints
            .worker_selector
            .insert("zone".into(), "a".into());
        let mut labels = BTreeMap::new();
        assert!(!constraints.matches(&labels));
        labels.insert("zone".to_string(), "a".to_string());
        labels.insert("rack".to_string(), "7".to_string());
        assert!(constraints.matches(&labels));
    }

    #[test]
    fn backend_kind_parses_its_own_name() {
        for kind in [
            BackendKind::LlamaBox,
            BackendKind::Vllm,
            BackendKind::Docker,
            BackendKind::Mock,
        ] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
    }
}
