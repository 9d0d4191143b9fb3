//! gpufleet Worker Agent
//!
//! The worker agent runs on each GPU host. It reports the host's inventory
//! and the state of every backend to the control plane, and launches or stops
//! inference backends when the control plane asks.
//!
//! ## Modules
//!
//! - `server`: agent RPC endpoints (StartBackend, StopBackend, heartbeat pull)
//! - `heartbeat`: push heartbeats and act on their acknowledgements
//! - `instance`: per-backend lifecycle and health supervision
//! - `backend`: launchers for llama-box, vLLM, containers and the mock server

pub mod agent;
pub mod backend;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod instance;
pub mod ports;
pub mod resources;
pub mod server;

pub use agent::WorkerAgent;
pub use instance::{InstanceManager, StartError};
