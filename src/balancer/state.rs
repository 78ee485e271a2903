use crate::registry::NetworkId;
use crate::sync::{read, write};
use serde::Serialize;
use std::sync::RwLock;

/// Whether the balancer flushes on its own when the active network loses its
/// last online node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalancerMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug)]
pub(crate) struct BalancerState {
    mode: RwLock<BalancerMode>,
    active: RwLock<NetworkId>,
}

impl BalancerState {
    pub(crate) fn new(mode: BalancerMode, active: NetworkId) -> Self {
        Self {
            mode: RwLock::new(mode),
            active: RwLock::new(active),
        }
    }

    pub(crate) fn mode(&self) -> BalancerMode {
        *read(&self.mode)
    }

    /// Stores `mode` and returns the previous one.
    pub(crate) fn set_mode(&self, mode: BalancerMode) -> BalancerMode {
        std::mem::replace(&mut *write(&self.mode), mode)
    }

    pub(crate) fn active(&self) -> NetworkId {
        read(&self.active).clone()
    }

    pub(crate) fn set_active(&self, network: NetworkId) -> NetworkId {
        std::mem::replace(&mut *write(&self.active), network)
    }
}
