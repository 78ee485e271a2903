//! Node registry: per-network node records, health state machine and
//! lease-based selection.

pub mod lease;
pub mod node;
pub mod prober;
pub mod store;

pub use lease::NodeLease;
pub use node::{NetworkId, NodeHealth, NodeId, NodeSnapshot, NodeTarget};
pub use prober::HealthProber;
pub use store::{NodeRegistry, Removal, DEFAULT_FAILURE_THRESHOLD};
