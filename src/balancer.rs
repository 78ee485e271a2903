//! Balancer controller split across focused submodules:
//! - `controller`: the public `Balancer` handle (start, flush, network switch)
//! - `state`: AUTO/MANUAL mode and the active network pointer
//! - `lifecycle`: metrics reporter, health prober and outage watcher tasks

mod controller;
mod lifecycle;
mod state;

pub use controller::Balancer;
pub use state::BalancerMode;
