//! Typed lifecycle events published by every balancer component.
//!
//! Events fan out over a broadcast channel so UI layers and tests can observe
//! the balancer without the core ever waiting on them. A subscriber that falls
//! behind loses the oldest events (`RecvError::Lagged`) instead of applying
//! backpressure.

use crate::dispatch::CallId;
use crate::pool::WorkerId;
use crate::registry::{NetworkId, NodeId};
use serde::Serialize;
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalancerEvent {
    NodeAdded {
        network: NetworkId,
        node: NodeId,
        endpoint: String,
    },
    NodeRemoved {
        network: NetworkId,
        node: NodeId,
        endpoint: String,
    },
    NodeOnline {
        node: NodeId,
        network: NetworkId,
    },
    NodeOffline {
        node: NodeId,
        network: NetworkId,
    },
    WorkerSpawned {
        worker: WorkerId,
        generation: u64,
    },
    WorkerKilled {
        worker: WorkerId,
        generation: u64,
    },
    WorkerProcessing {
        worker: WorkerId,
        call: CallId,
    },
    BalancerFlush {
        network: NetworkId,
        generation: u64,
    },
    BalancerAuto,
    BalancerManual,
    NodeCallRequested {
        call: CallId,
        network: NetworkId,
    },
    NodeCallSucceeded {
        call: CallId,
        network: NetworkId,
    },
    NodeCallFailed {
        call: CallId,
        network: NetworkId,
        error: String,
    },
    NodeCallTimeout {
        call: CallId,
        network: NetworkId,
    },
    #[serde(rename = "BALANCER_NETWORK_SWITCH_REQUESTED")]
    NetworkSwitchRequested {
        from: NetworkId,
        to: NetworkId,
    },
    #[serde(rename = "BALANCER_NETWORK_SWITCH_SUCCEEDED")]
    NetworkSwitchSucceeded {
        from: NetworkId,
        to: NetworkId,
        generation: u64,
    },
}

impl BalancerEvent {
    /// Action name consumed by UI reducers.
    pub fn name(&self) -> &'static str {
        match self {
            BalancerEvent::NodeAdded { .. } => "NODE_ADDED",
            BalancerEvent::NodeRemoved { .. } => "NODE_REMOVED",
            BalancerEvent::NodeOnline { .. } => "NODE_ONLINE",
            BalancerEvent::NodeOffline { .. } => "NODE_OFFLINE",
            BalancerEvent::WorkerSpawned { .. } => "WORKER_SPAWNED",
            BalancerEvent::WorkerKilled { .. } => "WORKER_KILLED",
            BalancerEvent::WorkerProcessing { .. } => "WORKER_PROCESSING",
            BalancerEvent::BalancerFlush { .. } => "BALANCER_FLUSH",
            BalancerEvent::BalancerAuto => "BALANCER_AUTO",
            BalancerEvent::BalancerManual => "BALANCER_MANUAL",
            BalancerEvent::NodeCallRequested { .. } => "NODE_CALL_REQUESTED",
            BalancerEvent::NodeCallSucceeded { .. } => "NODE_CALL_SUCCEEDED",
            BalancerEvent::NodeCallFailed { .. } => "NODE_CALL_FAILED",
            BalancerEvent::NodeCallTimeout { .. } => "NODE_CALL_TIMEOUT",
            BalancerEvent::NetworkSwitchRequested { .. } => "BALANCER_NETWORK_SWITCH_REQUESTED",
            BalancerEvent::NetworkSwitchSucceeded { .. } => "BALANCER_NETWORK_SWITCH_SUCCEEDED",
        }
    }
}

pub type EventReceiver = broadcast::Receiver<BalancerEvent>;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BalancerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BalancerEvent) {
        tracing::trace!(event = event.name(), "balancer event");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
