use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Name of a blockchain/service context with its own node pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NetworkId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NetworkId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-unique node identifier, assigned on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeHealth {
    Online,
    Offline,
}

/// The addressable part of a node handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub id: NodeId,
    pub network: NetworkId,
    pub endpoint: String,
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) endpoint: String,
    pub(crate) network: NetworkId,
    pub(crate) health: NodeHealth,
    pub(crate) consecutive_failures: u32,
    pub(crate) last_success: Option<Instant>,
    pub(crate) last_latency: Option<Duration>,
    pub(crate) last_used: Option<Instant>,
    pub(crate) in_flight: usize,
    pub(crate) pending_removal: bool,
}

impl Node {
    pub(crate) fn new(id: NodeId, network: NetworkId, endpoint: String) -> Self {
        Self {
            id,
            endpoint,
            network,
            health: NodeHealth::Offline,
            consecutive_failures: 0,
            last_success: None,
            last_latency: None,
            last_used: None,
            in_flight: 0,
            pending_removal: false,
        }
    }

    pub(crate) fn selectable(&self) -> bool {
        self.health == NodeHealth::Online && !self.pending_removal
    }

    pub(crate) fn target(&self) -> NodeTarget {
        NodeTarget {
            id: self.id,
            network: self.network.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    pub(crate) fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            network: self.network.clone(),
            endpoint: self.endpoint.clone(),
            health: self.health,
            consecutive_failures: self.consecutive_failures,
            last_success: self.last_success,
            last_latency: self.last_latency,
            in_flight: self.in_flight,
            pending_removal: self.pending_removal,
        }
    }
}

/// Point-in-time copy of a node's health bookkeeping.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub network: NetworkId,
    pub endpoint: String,
    pub health: NodeHealth,
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub last_latency: Option<Duration>,
    pub in_flight: usize,
    pub pending_removal: bool,
}
