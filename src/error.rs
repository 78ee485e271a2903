//! Error taxonomy shared by the registry, dispatcher, worker pool and
//! controller. Every variant is recoverable; nothing here is fatal to the
//! process.

use crate::registry::{NetworkId, NodeId};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum BalancerError {
    DuplicateNode {
        network: NetworkId,
        endpoint: String,
    },
    NotFound {
        node: NodeId,
    },
    InvalidEndpoint {
        endpoint: String,
    },
    NoAvailableNodes {
        network: NetworkId,
    },
    Cancelled,
    Timeout,
    UnderlyingCallError {
        endpoint: String,
        source: Arc<anyhow::Error>,
    },
    UnknownNetwork {
        network: NetworkId,
    },
    ShuttingDown,
}

impl BalancerError {
    pub(crate) fn underlying(endpoint: impl Into<String>, source: anyhow::Error) -> Self {
        BalancerError::UnderlyingCallError {
            endpoint: endpoint.into(),
            source: Arc::new(source),
        }
    }

    /// Whether the same request could succeed later without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BalancerError::NoAvailableNodes { .. }
                | BalancerError::Timeout
                | BalancerError::UnderlyingCallError { .. }
        )
    }
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerError::DuplicateNode { network, endpoint } => {
                write!(f, "node {endpoint} already registered on network {network}")
            }
            BalancerError::NotFound { node } => write!(f, "node {node} not found"),
            BalancerError::InvalidEndpoint { endpoint } => {
                write!(f, "invalid node endpoint {endpoint:?}")
            }
            BalancerError::NoAvailableNodes { network } => {
                write!(f, "no online nodes available on network {network}")
            }
            BalancerError::Cancelled => write!(f, "call cancelled"),
            BalancerError::Timeout => write!(f, "call deadline elapsed"),
            BalancerError::UnderlyingCallError { endpoint, source } => {
                write!(f, "call against {endpoint} failed: {source}")
            }
            BalancerError::UnknownNetwork { network } => {
                write!(f, "network {network} has no configured nodes")
            }
            BalancerError::ShuttingDown => write!(f, "balancer is shutting down"),
        }
    }
}

impl std::error::Error for BalancerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BalancerError::UnderlyingCallError { source, .. } => Some(&***source),
            _ => None,
        }
    }
}
