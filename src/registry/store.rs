//! Per-network node registry.
//!
//! Each network's nodes live behind their own mutex, so health transitions on
//! one network never contend with selection on another. Selection and lease
//! bookkeeping happen under the same lock, which keeps a node from being
//! selected while its removal is in progress.

use super::lease::NodeLease;
use super::node::{Node, NodeHealth, NodeId, NodeSnapshot, NodeTarget, NetworkId};
use crate::error::BalancerError;
use crate::events::{BalancerEvent, EventBus};
use crate::sync::{lock, read, write};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Result of [`NodeRegistry::remove_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The node is serving a call; it disappears once the call settles.
    Deferred,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum LeaseOutcome {
    Success(Duration),
    Failure,
    Released,
}

#[derive(Debug, Default)]
struct NetworkNodes {
    nodes: BTreeMap<NodeId, Node>,
}

#[derive(Debug)]
pub struct NodeRegistry {
    networks: RwLock<HashMap<NetworkId, Arc<Mutex<NetworkNodes>>>>,
    index: RwLock<HashMap<NodeId, NetworkId>>,
    next_id: AtomicU64,
    failure_threshold: u32,
    events: EventBus,
}

impl NodeRegistry {
    pub fn new(failure_threshold: u32, events: EventBus) -> Self {
        Self {
            networks: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            failure_threshold: failure_threshold.max(1),
            events,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Registers `endpoint` on `network` in the offline state.
    pub fn add_node(
        &self,
        network: &NetworkId,
        endpoint: impl Into<String>,
    ) -> Result<NodeId, BalancerError> {
        let endpoint = endpoint.into().trim().to_owned();
        if endpoint.is_empty() {
            return Err(BalancerError::InvalidEndpoint { endpoint });
        }

        let nodes = self.network_or_insert(network);
        let mut nodes = lock(&nodes);
        if nodes.nodes.values().any(|node| node.endpoint == endpoint) {
            return Err(BalancerError::DuplicateNode {
                network: network.clone(),
                endpoint,
            });
        }

        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        nodes
            .nodes
            .insert(id, Node::new(id, network.clone(), endpoint.clone()));
        write(&self.index).insert(id, network.clone());

        tracing::info!(network = %network, node = %id, endpoint = %endpoint, "node added");
        self.events.emit(BalancerEvent::NodeAdded {
            network: network.clone(),
            node: id,
            endpoint,
        });
        Ok(id)
    }

    pub fn remove_node(&self, network: &NetworkId, id: NodeId) -> Result<Removal, BalancerError> {
        let nodes = self
            .network(network)
            .ok_or(BalancerError::NotFound { node: id })?;
        let mut nodes = lock(&nodes);
        let node = nodes
            .nodes
            .get_mut(&id)
            .ok_or(BalancerError::NotFound { node: id })?;

        if node.in_flight > 0 {
            if !node.pending_removal {
                tracing::info!(
                    network = %network,
                    node = %id,
                    in_flight = node.in_flight,
                    "node busy; deferring removal until its calls settle"
                );
                node.pending_removal = true;
            }
            return Ok(Removal::Deferred);
        }

        self.finish_removal(&mut nodes, id);
        Ok(Removal::Removed)
    }

    pub fn mark_online(&self, id: NodeId) -> Result<(), BalancerError> {
        self.with_node(id, |registry, node| {
            registry.transition(node, NodeHealth::Online);
        })
    }

    /// Brings `id` online only while it has no failure on record. Returns
    /// whether the node changed state.
    pub fn mark_online_if_unfailed(&self, id: NodeId) -> Result<bool, BalancerError> {
        let mut promoted = false;
        self.with_node(id, |registry, node| {
            if node.consecutive_failures == 0 {
                promoted = registry.transition(node, NodeHealth::Online);
            }
        })?;
        Ok(promoted)
    }

    pub fn mark_offline(&self, id: NodeId) -> Result<(), BalancerError> {
        self.with_node(id, |registry, node| {
            registry.transition(node, NodeHealth::Offline);
        })
    }

    /// Picks the online node with the lowest latency sample, preferring the
    /// one idle the longest on ties, and leases it to the caller.
    ///
    /// Nodes without a latency sample rank as fastest so fresh nodes get
    /// measured. `exclude` lists nodes already tried for the current call.
    pub fn select_best_node(
        self: &Arc<Self>,
        network: &NetworkId,
        exclude: &[NodeId],
    ) -> Result<NodeLease, BalancerError> {
        let nodes = self
            .network(network)
            .ok_or_else(|| BalancerError::UnknownNetwork {
                network: network.clone(),
            })?;
        let mut nodes = lock(&nodes);

        let best = nodes
            .nodes
            .values_mut()
            .filter(|node| node.selectable() && !exclude.contains(&node.id))
            .min_by(|a, b| {
                a.last_latency
                    .unwrap_or_default()
                    .cmp(&b.last_latency.unwrap_or_default())
                    .then_with(|| a.last_used.cmp(&b.last_used))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .ok_or_else(|| BalancerError::NoAvailableNodes {
                network: network.clone(),
            })?;

        best.last_used = Some(Instant::now());
        best.in_flight += 1;
        Ok(NodeLease::new(Arc::clone(self), best.target()))
    }

    pub fn online_count(&self, network: &NetworkId) -> usize {
        self.inspect(network, |nodes| nodes.values().filter(|n| n.selectable()).count())
            .unwrap_or(0)
    }

    /// Whether `network` has at least one node that is not being removed.
    pub fn has_nodes(&self, network: &NetworkId) -> bool {
        self.inspect(network, |nodes| nodes.values().any(|n| !n.pending_removal))
            .unwrap_or(false)
    }

    pub fn networks(&self) -> Vec<NetworkId> {
        let mut networks: Vec<NetworkId> = read(&self.networks).keys().cloned().collect();
        networks.sort();
        networks
    }

    pub fn nodes(&self, network: &NetworkId) -> Vec<NodeSnapshot> {
        self.inspect(network, |nodes| nodes.values().map(Node::snapshot).collect())
            .unwrap_or_default()
    }

    pub fn node(&self, id: NodeId) -> Option<NodeSnapshot> {
        let network = read(&self.index).get(&id).cloned()?;
        self.inspect(&network, |nodes| nodes.get(&id).map(Node::snapshot))
            .flatten()
    }

    /// Offline nodes eligible for a health probe.
    pub fn offline_targets(&self, network: &NetworkId) -> Vec<NodeTarget> {
        self.inspect(network, |nodes| {
            nodes
                .values()
                .filter(|n| n.health == NodeHealth::Offline && !n.pending_removal)
                .map(Node::target)
                .collect()
        })
        .unwrap_or_default()
    }

    /// Applies the outcome of a leased call. Returns `true` if the node's
    /// health changed as a result.
    pub(crate) fn settle(&self, target: &NodeTarget, outcome: LeaseOutcome) -> bool {
        let Some(nodes) = self.network(&target.network) else {
            return false;
        };
        let mut nodes = lock(&nodes);
        let Some(node) = nodes.nodes.get_mut(&target.id) else {
            return false;
        };
        node.in_flight = node.in_flight.saturating_sub(1);

        if node.pending_removal {
            if node.in_flight == 0 {
                self.finish_removal(&mut nodes, target.id);
            }
            return false;
        }

        match outcome {
            LeaseOutcome::Success(latency) => {
                node.last_latency = Some(latency);
                node.last_success = Some(Instant::now());
                node.consecutive_failures = 0;
                self.transition(node, NodeHealth::Online)
            }
            LeaseOutcome::Failure => {
                node.consecutive_failures = node.consecutive_failures.saturating_add(1);
                tracing::debug!(
                    node = %node.id,
                    endpoint = %node.endpoint,
                    consecutive_failures = node.consecutive_failures,
                    threshold = self.failure_threshold,
                    "node call failed"
                );
                if node.consecutive_failures >= self.failure_threshold {
                    self.transition(node, NodeHealth::Offline)
                } else {
                    false
                }
            }
            LeaseOutcome::Released => false,
        }
    }

    fn transition(&self, node: &mut Node, next: NodeHealth) -> bool {
        match next {
            NodeHealth::Online => node.consecutive_failures = 0,
            // Parked at the threshold so a single probe or success is needed
            // before the node counts as healthy again.
            NodeHealth::Offline => node.consecutive_failures = self.failure_threshold,
        }

        if node.health == next {
            return false;
        }
        node.health = next;

        let event = match next {
            NodeHealth::Online => {
                tracing::info!(
                    network = %node.network,
                    node = %node.id,
                    endpoint = %node.endpoint,
                    "node online"
                );
                BalancerEvent::NodeOnline {
                    node: node.id,
                    network: node.network.clone(),
                }
            }
            NodeHealth::Offline => {
                tracing::warn!(
                    network = %node.network,
                    node = %node.id,
                    endpoint = %node.endpoint,
                    "node offline"
                );
                BalancerEvent::NodeOffline {
                    node: node.id,
                    network: node.network.clone(),
                }
            }
        };
        self.events.emit(event);
        true
    }

    fn with_node<F>(&self, id: NodeId, apply: F) -> Result<(), BalancerError>
    where
        F: FnOnce(&Self, &mut Node),
    {
        let network = read(&self.index)
            .get(&id)
            .cloned()
            .ok_or(BalancerError::NotFound { node: id })?;
        let nodes = self
            .network(&network)
            .ok_or(BalancerError::NotFound { node: id })?;
        let mut nodes = lock(&nodes);
        match nodes.nodes.get_mut(&id) {
            Some(node) if !node.pending_removal => {
                apply(self, node);
                Ok(())
            }
            _ => Err(BalancerError::NotFound { node: id }),
        }
    }

    fn finish_removal(&self, nodes: &mut NetworkNodes, id: NodeId) {
        let Some(node) = nodes.nodes.remove(&id) else {
            return;
        };
        write(&self.index).remove(&id);
        tracing::info!(
            network = %node.network,
            node = %id,
            endpoint = %node.endpoint,
            "node removed"
        );
        self.events.emit(BalancerEvent::NodeRemoved {
            network: node.network,
            node: id,
            endpoint: node.endpoint,
        });
    }

    fn inspect<R, F>(&self, network: &NetworkId, view: F) -> Option<R>
    where
        F: FnOnce(&BTreeMap<NodeId, Node>) -> R,
    {
        let nodes = self.network(network)?;
        let guard = lock(&nodes);
        let result = view(&guard.nodes);
        Some(result)
    }

    fn network(&self, network: &NetworkId) -> Option<Arc<Mutex<NetworkNodes>>> {
        read(&self.networks).get(network).cloned()
    }

    fn network_or_insert(&self, network: &NetworkId) -> Arc<Mutex<NetworkNodes>> {
        if let Some(nodes) = self.network(network) {
            return nodes;
        }
        Arc::clone(write(&self.networks).entry(network.clone()).or_default())
    }
}
