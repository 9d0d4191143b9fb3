//! # gpufleet-types
//!
//! Records that cross component boundaries: desired model specs, the worker
//! inventory and its reservation ledger, model instances and their lifecycle,
//! placement decisions, routing entries and the worker agent wire format.

pub mod agent;
pub mod instance;
pub mod model;
pub mod placement;
pub mod route;
pub mod worker;

pub use agent::{
    GroupMembership, HeartbeatAck, HeartbeatReport, ReportedInstance, ReportedState,
    StartBackendRequest, StartBackendResponse, StopBackendResponse,
};
pub use instance::{
    Endpoint, FailureReason, InstanceFailure, InstanceState, ModelInstance, TransitionError,
};
pub use model::{
    Affinity, BackendKind, ContainerSpec, Model, ModelPhase, ModelSpec, ModelStatus, Parallelism,
    PlacementConstraints, ResourceRequirements, SpecError,
};
pub use placement::{Placement, PlacementDecision, WorkerSlice};
pub use route::{RouteEndpoint, RouteEntry, RoutesSnapshot};
pub use worker::{
    Capacity, GpuDevice, GpuVendor, LedgerViolation, Reservation, Usage, Worker, WorkerHealth,
};
