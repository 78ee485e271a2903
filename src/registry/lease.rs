use super::node::{NodeId, NodeTarget};
use super::store::{LeaseOutcome, NodeRegistry};
use std::sync::Arc;
use std::time::Duration;

/// In-flight claim on a node returned by [`NodeRegistry::select_best_node`].
///
/// While a lease is alive the node cannot be removed out from under the call;
/// removal is deferred until the last lease is settled. Dropping an unsettled
/// lease releases it without touching the node's health.
pub struct NodeLease {
    registry: Arc<NodeRegistry>,
    target: NodeTarget,
    settled: bool,
}

impl NodeLease {
    pub(super) fn new(registry: Arc<NodeRegistry>, target: NodeTarget) -> Self {
        Self {
            registry,
            target,
            settled: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.target.id
    }

    pub fn target(&self) -> &NodeTarget {
        &self.target
    }

    pub fn endpoint(&self) -> &str {
        &self.target.endpoint
    }

    /// Records a successful call and returns `true` if the node was promoted.
    pub fn succeed(mut self, latency: Duration) -> bool {
        self.settle(LeaseOutcome::Success(latency))
    }

    /// Records a failed or timed-out call and returns `true` if the node was
    /// demoted to offline.
    pub fn fail(mut self) -> bool {
        self.settle(LeaseOutcome::Failure)
    }

    /// Gives the node back without counting the attempt either way.
    pub fn release(mut self) {
        self.settle(LeaseOutcome::Released);
    }

    fn settle(&mut self, outcome: LeaseOutcome) -> bool {
        if self.settled {
            return false;
        }
        self.settled = true;
        self.registry.settle(&self.target, outcome)
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(LeaseOutcome::Released);
        }
    }
}

impl std::fmt::Debug for NodeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLease")
            .field("target", &self.target)
            .field("settled", &self.settled)
            .finish()
    }
}
