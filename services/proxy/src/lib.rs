//! gpufleet Proxy
//!
//! Routes inference requests to running model instances. The route table
//! follows the control plane's event feed; requests are balanced across the
//! running instances of the named model and streamed back unbuffered.

pub mod config;
pub mod error;
pub mod forward;
pub mod persistence;
pub mod routing;
pub mod server;
pub mod sync;

pub use error::ProxyError;
pub use forward::Forwarder;
pub use routing::{BalancePolicy, Balancer, RouteTable};
pub use server::{create_router, ProxyState};
pub use sync::RouteSync;
