//! # gpufleet-id
//!
//! Typed identifiers for fleet resources.
//!
//! Every id renders as `{prefix}_{ulid}`:
//!
//! - `mdl_01HV4Z2WQXKJNM8GPQY6VBKC3D` (model)
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F` (model instance)
//! - `wkr_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (worker)
//!
//! The prefix keeps ids of different resources from being mixed up at API
//! boundaries, and the ULID body sorts by creation time. The scheduler relies
//! on that ordering for deterministic tie-breaks and the controller relies on
//! it to find the newest replicas.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
