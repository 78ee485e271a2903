use crate::dispatch::{CallId, CallPayload};
use crate::registry::NetworkId;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Process-unique worker identifier. Ids are never reused across generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(pub(crate) u64);

impl WorkerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "call", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Idle,
    Processing(CallId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub generation: u64,
    pub state: WorkerState,
}

/// Which workers a flush takes down besides the idle ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// Workers serving a call on the flushed network are killed as well.
    Network,
    /// Busy workers finish their calls and carry over into the new generation.
    Idle,
}

/// A call waiting in the pool's FIFO queue.
#[derive(Debug, Clone)]
pub struct QueuedCall {
    pub id: CallId,
    pub network: NetworkId,
    pub payload: Arc<CallPayload>,
    pub deadline: Instant,
    /// Bumped each time the call is put back on the queue after a flush so
    /// reports from the earlier binding can be told apart.
    pub attempt: u32,
}

/// What a worker gets back when it asks the pool for work.
#[derive(Debug)]
pub(super) enum Claim {
    Call(QueuedCall),
    Empty,
    /// The worker was killed or belongs to an older generation.
    Retired,
}

/// Health verdict for the node used by one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NodeVerdict {
    Succeeded(std::time::Duration),
    Failed,
}
