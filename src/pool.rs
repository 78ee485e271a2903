//! Worker pool split across focused submodules:
//! - `types`: worker ids, snapshots and queued call records
//! - `worker_pool`: the pool itself (queue, generations, flush, resize)
//! - `worker`: the per-worker claim/execute/report loop
//! - `backoff`: retry helper used while a network has no online node
//! - `tests`: worker pool unit tests

mod backoff;
mod types;
mod worker;
mod worker_pool;


pub use types::{FlushScope, QueuedCall, WorkerId, WorkerSnapshot, WorkerState};
pub use worker_pool::{WorkerPool, WorkerPoolParams, WorkerSettings};
