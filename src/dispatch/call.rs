use super::dispatcher::CallDispatcher;
use crate::error::BalancerError;
use crate::registry::NetworkId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Weak;
use tokio::sync::{oneshot, watch};

/// Process-unique call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CallId(pub(crate) u64);

impl CallId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Opaque request forwarded to a node. The balancer never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl CallPayload {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Requested,
    Succeeded,
    Failed,
    TimedOut,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Requested)
    }

    pub(crate) fn of(result: &CallResult) -> Self {
        match result {
            Ok(_) => CallStatus::Succeeded,
            Err(BalancerError::Timeout) => CallStatus::TimedOut,
            Err(_) => CallStatus::Failed,
        }
    }
}

pub type CallResult = Result<Value, BalancerError>;

/// Caller side of a submitted call.
#[derive(Debug)]
pub struct CallHandle {
    pub(super) id: CallId,
    pub(super) network: NetworkId,
    pub(super) status: watch::Receiver<CallStatus>,
    pub(super) result: oneshot::Receiver<CallResult>,
    pub(super) dispatcher: Weak<CallDispatcher>,
}

impl CallHandle {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn network(&self) -> &NetworkId {
        &self.network
    }

    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status transition of this call.
    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Cancels the call. Returns `false` if it had already settled.
    pub fn cancel(&self) -> bool {
        self.canceller().cancel()
    }

    /// Detached cancel capability, usable while [`CallHandle::wait`] is pending.
    pub fn canceller(&self) -> CallCanceller {
        CallCanceller {
            id: self.id,
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Waits for the terminal result.
    pub async fn wait(self) -> CallResult {
        match self.result.await {
            Ok(result) => result,
            // The dispatcher went away without settling the call.
            Err(_) => Err(BalancerError::ShuttingDown),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallCanceller {
    id: CallId,
    dispatcher: Weak<CallDispatcher>,
}

impl CallCanceller {
    pub fn cancel(&self) -> bool {
        self.dispatcher
            .upgrade()
            .map(|dispatcher| dispatcher.cancel(self.id))
            .unwrap_or(false)
    }
}
