//! Model routing.
//!
//! ```text
//! event feed -> RouteTable (ArcSwap) -> Balancer -> endpoint
//! ```

mod balancer;
mod table;

pub use balancer::{BalancePolicy, Balancer, InflightGuard};
pub use table::RouteTable;
