//! Model instances and their lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use gpufleet_id::{InstanceId, ModelId, WorkerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Model;
use crate::placement::Placement;

/// Lifecycle state of a model instance.
///
/// ```text
/// Pending -> Scheduled -> Starting -> Running <-> Unhealthy
///    ^           |            |                      |
///    +-----------+------------+----------------------+   (reschedule)
///
/// any non-terminal -> Failed | Terminating
/// Failed -> Terminating
/// ```
///
/// Terminating is final: the record is deleted once the worker confirms the
/// backend is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Scheduled,
    Starting,
    Running,
    Unhealthy,
    Terminating,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Scheduled => "scheduled",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Unhealthy => "unhealthy",
            InstanceState::Terminating => "terminating",
            InstanceState::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, to: InstanceState) -> bool {
        use InstanceState::*;

        if *self == to {
            return true;
        }
        match (self, to) {
            (Terminating, _) => false,
            (Failed, Terminating) => true,
            (Failed, _) => false,
            (_, Terminating | Failed) => true,
            (Pending, Scheduled) => true,
            (Scheduled, Starting | Running | Unhealthy | Pending) => true,
            (Starting, Running | Unhealthy | Pending) => true,
            (Running, Unhealthy) => true,
            (Unhealthy, Running | Starting | Pending) => true,
            _ => false,
        }
    }

    /// Counts toward the model's replica total.
    pub fn is_active(&self) -> bool {
        !matches!(self, InstanceState::Terminating | InstanceState::Failed)
    }

    /// Holds (or is waiting on) a worker placement.
    pub fn is_placed(&self) -> bool {
        matches!(
            self,
            InstanceState::Scheduled
                | InstanceState::Starting
                | InstanceState::Running
                | InstanceState::Unhealthy
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceState::Pending),
            "scheduled" => Ok(InstanceState::Scheduled),
            "starting" => Ok(InstanceState::Starting),
            "running" => Ok(InstanceState::Running),
            "unhealthy" => Ok(InstanceState::Unhealthy),
            "terminating" => Ok(InstanceState::Terminating),
            "failed" => Ok(InstanceState::Failed),
            other => Err(format!("unknown instance state '{other}'")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid instance transition {from} -> {to}")]
pub struct TransitionError {
    pub from: InstanceState,
    pub to: InstanceState,
}

/// Network address of a backend process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The agent refused or could not launch the backend.
    BackendStartFailure,
    /// The backend did not become ready before its reservation expired.
    StartTimeout,
    /// The backend process exited.
    ProcessExited,
    /// The backend stopped answering health probes.
    HealthCheckFailed,
    /// The hosting worker stopped heartbeating.
    WorkerLost,
    /// Restart and reschedule budgets are spent.
    RestartsExhausted,
    /// The instance's spec can never be placed or started.
    InvalidSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFailure {
    pub reason: FailureReason,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One replica of a model revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstance {
    pub id: InstanceId,
    pub model_id: ModelId,
    pub model_name: String,
    /// Revision the instance was created from.
    pub revision: u64,
    /// Template hash of that revision. Instances whose hash matches the
    /// model's current hash are not replaced by a rollout.
    pub template_hash: String,
    pub state: InstanceState,
    pub placement: Option<Placement>,
    pub endpoint: Option<Endpoint>,
    /// The agent acknowledged StartBackend for the current placement.
    #[serde(default)]
    pub start_acknowledged: bool,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub reschedule_count: u32,
    #[serde(default)]
    pub start_attempts: u32,
    /// Workers this instance must not be placed on again.
    #[serde(default)]
    pub excluded_workers: Vec<WorkerId>,
    #[serde(default)]
    pub failure: Option<InstanceFailure>,
    #[serde(default)]
    pub reservation_expires_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped by every store write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelInstance {
    /// A fresh Pending replica of the model's current revision.
    pub fn pending(model: &Model, now: DateTime<Utc>) -> Self {
        Self {
            id: InstanceId::new(),
            model_id: model.id,
            model_name: model.spec.name.clone(),
            revision: model.revision,
            template_hash: model.template_hash.clone(),
            state: InstanceState::Pending,
            placement: None,
            endpoint: None,
            start_acknowledged: false,
            restart_count: 0,
            reschedule_count: 0,
            start_attempts: 0,
            excluded_workers: Vec::new(),
            failure: None,
            reservation_expires_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Head worker of the current placement.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.placement.as_ref().map(|p| p.head)
    }

    pub fn is_on(&self, worker_id: WorkerId) -> bool {
        self.placement
            .as_ref()
            .is_some_and(|p| p.contains(worker_id))
    }

    pub fn is_current(&self, model: &Model) -> bool {
        self.template_hash == model.template_hash
    }

    pub fn transition(
        &mut self,
        to: InstanceState,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Drops the placement and returns to Pending so the scheduler can pick
    /// another worker. The old head is excluded from the next placement.
    pub fn unplace(&mut self, exclude_head: bool, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(InstanceState::Pending, now)?;
        if exclude_head {
            if let Some(head) = self.worker_id() {
                if !self.excluded_workers.contains(&head) {
                    self.excluded_workers.push(head);
                }
            }
        }
        self.clear_placement();
        Ok(())
    }

    /// Forgets the worker assignment. The store releases the reservations of
    /// an instance without placement on the next write.
    pub fn clear_placement(&mut self) {
        self.placement = None;
        self.endpoint = None;
        self.start_acknowledged = false;
        self.reservation_expires_at = None;
    }

    pub fn fail(&mut self, reason: FailureReason, message: impl Into<String>, now: DateTime<Utc>) {
        self.failure = Some(InstanceFailure {
            reason,
            message: message.into(),
            at: now,
        });
    }
}
