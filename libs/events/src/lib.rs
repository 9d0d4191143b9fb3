//! # gpufleet-events
//!
//! The control plane appends an event to its log for every change that
//! another component reacts to without reading the store: instance state
//! changes, model revisions and deletions, worker health flips. The proxy
//! tails this log to keep its routing table current.
//!
//! Events are ordered by a global, monotonic [`EventId`](gpufleet_id::EventId).
//! Payloads are typed here and carried as JSON on the wire.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
