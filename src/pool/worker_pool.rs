//! Worker pool orchestration.
//!
//! The pool owns worker records and the FIFO call queue behind one mutex. Work
//! claims, result reports and flushes all happen under that lock, so a flush
//! is atomic with respect to every worker: once the generation moves on, no
//! killed worker can claim a call or touch node health.
//!
//! A flush only reaches one network. Idle workers and workers serving the
//! flushed network are replaced; workers busy on any other network keep their
//! call and are carried into the new generation.

use super::types::{
    Claim, FlushScope, NodeVerdict, QueuedCall, WorkerId, WorkerSnapshot, WorkerState,
};
use super::worker::Worker;
use crate::dispatch::{CallDispatcher, CallId, CallResult};
use crate::error::BalancerError;
use crate::events::{BalancerEvent, EventBus};
use crate::registry::{NetworkId, NodeLease, NodeRegistry};
use crate::runtime::config::BalancerConfig;
use crate::runtime::executor::CallExecutor;
use crate::runtime::telemetry::Telemetry;
use crate::sync::lock;
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-call execution knobs copied out of [`BalancerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub no_node_backoff: Duration,
    pub no_node_attempts: usize,
    pub max_node_attempts: usize,
    pub requeue_on_flush: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &BalancerConfig) -> Self {
        Self {
            pool_size: config.pool_size(),
            no_node_backoff: config.no_node_backoff(),
            no_node_attempts: config.no_node_attempts(),
            max_node_attempts: config.max_node_attempts(),
            requeue_on_flush: config.requeue_on_flush(),
        }
    }
}

pub struct WorkerPoolParams {
    pub registry: Arc<NodeRegistry>,
    pub executor: Arc<dyn CallExecutor>,
    pub dispatcher: Weak<CallDispatcher>,
    pub events: EventBus,
    pub telemetry: Arc<Telemetry>,
    pub generation: Arc<AtomicU64>,
    pub shutdown: CancellationToken,
    pub settings: WorkerSettings,
}

struct WorkerRecord {
    generation: u64,
    state: WorkerState,
    attempt: u32,
    /// Network of the bound call while processing.
    network: Option<NetworkId>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PoolState {
    workers: BTreeMap<WorkerId, WorkerRecord>,
    queue: VecDeque<QueuedCall>,
    target_size: usize,
    next_worker_id: u64,
    /// Killed workers that may still be finishing a node call.
    retired: Vec<JoinHandle<()>>,
    closed: bool,
}

pub struct WorkerPool {
    state: Mutex<PoolState>,
    pub(super) work_ready: Notify,
    pub(super) registry: Arc<NodeRegistry>,
    pub(super) executor: Arc<dyn CallExecutor>,
    dispatcher: Weak<CallDispatcher>,
    events: EventBus,
    telemetry: Arc<Telemetry>,
    generation: Arc<AtomicU64>,
    shutdown: CancellationToken,
    pub(super) settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(params: WorkerPoolParams) -> Self {
        let WorkerPoolParams {
            registry,
            executor,
            dispatcher,
            events,
            telemetry,
            generation,
            shutdown,
            settings,
        } = params;

        Self {
            state: Mutex::new(PoolState {
                next_worker_id: 1,
                target_size: settings.pool_size.max(1),
                ..PoolState::default()
            }),
            work_ready: Notify::new(),
            registry,
            executor,
            dispatcher,
            events,
            telemetry,
            generation,
            shutdown,
            settings,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Adds `count` idle workers to the current generation.
    pub fn spawn(self: &Arc<Self>, count: usize) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        self.spawn_locked(&mut state, count);
        state.target_size = state.workers.len().max(1);
        self.telemetry.record_worker_pool_size(state.workers.len());
    }

    /// Kills the workers `scope` selects on `network`, bumps the generation
    /// and tops the pool back up to its target size.
    ///
    /// Calls bound to killed workers are failed with `Cancelled`, or put back
    /// at the head of the queue when requeueing is enabled.
    pub fn flush(self: &Arc<Self>, network: &NetworkId, scope: FlushScope) -> u64 {
        let mut state = lock(&self.state);
        let victims: Vec<WorkerId> = state
            .workers
            .iter()
            .filter(|(_, record)| match &record.network {
                None => true,
                Some(bound) => scope == FlushScope::Network && bound == network,
            })
            .map(|(id, _)| *id)
            .collect();
        let bound = self.kill_locked(&mut state, &victims);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        for record in state.workers.values_mut() {
            record.generation = generation;
        }
        let carried = state.workers.len();
        if !state.closed {
            let missing = state.target_size.saturating_sub(carried);
            self.spawn_locked(&mut state, missing);
        }
        let (requeued, cancelled) = self.release_bound_locked(&mut state, bound);
        self.telemetry.record_worker_pool_size(state.workers.len());
        drop(state);

        if requeued > 0 {
            self.work_ready.notify_one();
        }
        tracing::info!(
            network = %network,
            scope = ?scope,
            generation,
            killed = victims.len(),
            carried,
            requeued,
            cancelled,
            "worker pool flushed"
        );
        generation
    }

    /// Grows or shrinks the current generation to `size` workers. Idle
    /// workers are killed before busy ones.
    pub fn resize(self: &Arc<Self>, size: usize) {
        let size = size.max(1);
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.target_size = size;

        let current = state.workers.len();
        if size > current {
            self.spawn_locked(&mut state, size - current);
        } else if size < current {
            let mut victims: Vec<(bool, WorkerId)> = state
                .workers
                .iter()
                .map(|(id, record)| (record.state != WorkerState::Idle, *id))
                .collect();
            victims.sort();
            let victims: Vec<WorkerId> = victims
                .into_iter()
                .take(current - size)
                .map(|(_, id)| id)
                .collect();
            let bound = self.kill_locked(&mut state, &victims);
            let (requeued, _) = self.release_bound_locked(&mut state, bound);
            if requeued > 0 {
                self.work_ready.notify_one();
            }
        }
        self.telemetry.record_worker_pool_size(state.workers.len());
        tracing::info!(size, previous = current, "worker pool resized");
    }

    /// Appends a call to the queue. Returns `false` once the pool is shut down.
    pub fn submit(&self, call: QueuedCall) -> bool {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return false;
            }
            state.queue.push_back(call);
        }
        self.work_ready.notify_one();
        true
    }

    /// Takes a not-yet-claimed call out of the queue.
    pub fn remove_queued(&self, call: CallId) -> bool {
        let mut state = lock(&self.state);
        match state.queue.iter().position(|queued| queued.id == call) {
            Some(index) => {
                state.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Kills every worker for good and aborts their tasks. Queued calls are
    /// dropped; their records are failed by the dispatcher.
    pub fn shutdown(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;

        let workers = std::mem::take(&mut state.workers);
        for (id, mut record) in workers {
            record.token.cancel();
            if let Some(handle) = record.handle.take() {
                handle.abort();
            }
            self.events.emit(BalancerEvent::WorkerKilled {
                worker: id,
                generation: record.generation,
            });
        }
        for handle in state.retired.drain(..) {
            handle.abort();
        }
        let dropped = state.queue.len();
        state.queue.clear();
        self.telemetry.record_worker_pool_size(0);
        tracing::info!(dropped_calls = dropped, "worker pool shut down");
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        lock(&self.state)
            .workers
            .iter()
            .map(|(id, record)| WorkerSnapshot {
                id: *id,
                generation: record.generation,
                state: record.state,
            })
            .collect()
    }

    pub fn size(&self) -> usize {
        lock(&self.state).workers.len()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Hands the next live call to `worker`, binding it under the pool lock.
    pub(super) fn claim(&self, worker: WorkerId) -> Claim {
        let mut state = lock(&self.state);
        let generation = self.generation();
        let PoolState {
            workers, queue, ..
        } = &mut *state;

        let Some(record) = workers.get_mut(&worker) else {
            return Claim::Retired;
        };
        if record.generation != generation {
            return Claim::Retired;
        }
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return Claim::Retired;
        };

        while let Some(call) = queue.pop_front() {
            if !dispatcher.begin(call.id, call.attempt) {
                tracing::trace!(call = %call.id, "skipping settled call");
                continue;
            }

            record.state = WorkerState::Processing(call.id);
            record.attempt = call.attempt;
            record.network = Some(call.network.clone());
            self.events.emit(BalancerEvent::WorkerProcessing {
                worker,
                call: call.id,
            });
            if !queue.is_empty() {
                self.work_ready.notify_one();
            }
            return Claim::Call(call);
        }

        Claim::Empty
    }

    /// Applies an intermediate node verdict. Returns `false` if `worker` no
    /// longer belongs to the current generation, in which case nothing is
    /// recorded.
    pub(super) fn settle_node(&self, worker: WorkerId, lease: NodeLease, verdict: NodeVerdict) -> bool {
        let state = lock(&self.state);
        if !self.is_current(&state, worker) {
            drop(state);
            lease.release();
            return false;
        }
        self.apply_verdict(lease, verdict);
        true
    }

    /// Final report for `call`: node verdict plus terminal result, applied
    /// only if `worker` is still current.
    pub(super) fn report(
        &self,
        worker: WorkerId,
        call: &QueuedCall,
        node: Option<(NodeLease, NodeVerdict)>,
        result: CallResult,
    ) -> bool {
        let mut state = lock(&self.state);
        if !self.is_current(&state, worker) {
            drop(state);
            if let Some((lease, _)) = node {
                lease.release();
            }
            tracing::debug!(
                worker = %worker,
                call = %call.id,
                "discarding result from retired worker"
            );
            return false;
        }

        if let Some((lease, verdict)) = node {
            self.apply_verdict(lease, verdict);
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.complete(call.id, call.attempt, result);
        }
        if let Some(record) = state.workers.get_mut(&worker) {
            record.state = WorkerState::Idle;
            record.network = None;
        }
        true
    }

    fn apply_verdict(&self, lease: NodeLease, verdict: NodeVerdict) {
        match verdict {
            NodeVerdict::Succeeded(latency) => {
                lease.succeed(latency);
            }
            NodeVerdict::Failed => {
                self.telemetry.record_node_failure();
                lease.fail();
            }
        }
    }

    fn is_current(&self, state: &PoolState, worker: WorkerId) -> bool {
        state
            .workers
            .get(&worker)
            .map(|record| record.generation == self.generation())
            .unwrap_or(false)
    }

    fn spawn_locked(self: &Arc<Self>, state: &mut PoolState, count: usize) {
        let generation = self.generation();
        for _ in 0..count {
            let id = WorkerId(state.next_worker_id);
            state.next_worker_id += 1;

            let token = self.shutdown.child_token();
            let worker = Worker::new(id, generation, token.clone(), Arc::clone(self));
            let pool = Arc::downgrade(self);

            let handle = tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await;

                if let Err(panic_payload) = result {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    tracing::error!(worker = %id, panic = %panic_msg, "worker task panicked");
                    if let Some(pool) = pool.upgrade() {
                        pool.replace_panicked(id);
                    }
                }
            });

            state.workers.insert(
                id,
                WorkerRecord {
                    generation,
                    state: WorkerState::Idle,
                    attempt: 0,
                    network: None,
                    token,
                    handle: Some(handle),
                },
            );
            tracing::debug!(worker = %id, generation, "worker spawned");
            self.events
                .emit(BalancerEvent::WorkerSpawned { worker: id, generation });
        }
    }

    /// Removes `victims` from the pool and returns the calls they were bound to.
    fn kill_locked(&self, state: &mut PoolState, victims: &[WorkerId]) -> Vec<(CallId, u32)> {
        state.retired.retain(|handle| !handle.is_finished());

        let mut bound = Vec::new();
        for id in victims {
            let Some(mut record) = state.workers.remove(id) else {
                continue;
            };
            record.token.cancel();
            if let Some(handle) = record.handle.take() {
                state.retired.push(handle);
            }
            if let WorkerState::Processing(call) = record.state {
                bound.push((call, record.attempt));
            }
            tracing::debug!(worker = %id, generation = record.generation, "worker killed");
            self.events.emit(BalancerEvent::WorkerKilled {
                worker: *id,
                generation: record.generation,
            });
        }
        bound
    }

    /// Requeues or cancels calls whose worker was killed. Returns
    /// `(requeued, cancelled)`.
    fn release_bound_locked(&self, state: &mut PoolState, bound: Vec<(CallId, u32)>) -> (usize, usize) {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return (0, 0);
        };

        let mut requeued = 0;
        let mut cancelled = 0;
        // Reverse so the calls keep their relative order at the queue head.
        for (call, attempt) in bound.into_iter().rev() {
            if self.settings.requeue_on_flush && !state.closed {
                if let Some(queued) = dispatcher.requeue(call, attempt) {
                    state.queue.push_front(queued);
                    requeued += 1;
                    continue;
                }
            }
            if dispatcher.complete(call, attempt, Err(BalancerError::Cancelled)) {
                cancelled += 1;
            }
        }
        (requeued, cancelled)
    }

    fn replace_panicked(self: &Arc<Self>, worker: WorkerId) {
        let mut state = lock(&self.state);
        if !self.is_current(&state, worker) {
            return;
        }
        let bound = self.kill_locked(&mut state, &[worker]);
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            for (call, attempt) in bound {
                dispatcher.complete(call, attempt, Err(BalancerError::Cancelled));
            }
        }
        if !state.closed {
            self.spawn_locked(&mut state, 1);
        }
        self.telemetry.record_worker_pool_size(state.workers.len());
    }
}

pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
