//! gpufleet control plane library.
//!
//! The `control-plane` binary wires these pieces together; the library surface
//! exists so the end-to-end tests can run the whole control plane in-process.

pub mod agent_client;
pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod runtime;
pub mod scheduler;
pub mod state;
