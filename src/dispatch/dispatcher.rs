//! Call lifecycle bookkeeping.
//!
//! The dispatcher owns every non-terminal call record. A record is removed at
//! the moment its call settles, so whichever of worker report, deadline timer,
//! caller cancel or shutdown gets to it first decides the outcome and every
//! later report finds nothing to act on.
//!
//! Lock order is pool, then dispatcher, then registry: the pool reports into
//! the dispatcher while holding its own lock, so nothing here calls into the
//! pool before the dispatcher lock is released.

use super::call::{CallHandle, CallId, CallPayload, CallResult, CallStatus};
use crate::error::BalancerError;
use crate::events::{BalancerEvent, EventBus};
use crate::pool::{QueuedCall, WorkerPool, WorkerPoolParams, WorkerSettings};
use crate::registry::{NetworkId, NodeRegistry};
use crate::runtime::executor::CallExecutor;
use crate::runtime::telemetry::Telemetry;
use crate::sync::lock;
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

pub struct DispatchParams {
    pub registry: Arc<NodeRegistry>,
    pub executor: Arc<dyn CallExecutor>,
    pub events: EventBus,
    pub telemetry: Arc<Telemetry>,
    pub generation: Arc<AtomicU64>,
    pub shutdown: CancellationToken,
    pub settings: WorkerSettings,
    pub default_timeout: Duration,
}

struct CallRecord {
    network: NetworkId,
    payload: Arc<CallPayload>,
    attempt: u32,
    running: bool,
    submitted_at: Instant,
    deadline: Instant,
    status_tx: watch::Sender<CallStatus>,
    result_tx: Option<oneshot::Sender<CallResult>>,
    timer: Option<JoinHandle<()>>,
}

/// How many calls settled by a worker report are remembered, so a second
/// report for one of them can be told apart from a lost race with a cancel
/// or deadline.
const REPORTED_HISTORY: usize = 256;

#[derive(Default)]
struct DispatcherState {
    calls: HashMap<CallId, CallRecord>,
    /// Recently settled `(call, attempt)` pairs, oldest first.
    reported: VecDeque<(CallId, u32)>,
    closed: bool,
}

pub struct CallDispatcher {
    state: Mutex<DispatcherState>,
    pool: Arc<WorkerPool>,
    registry: Arc<NodeRegistry>,
    events: EventBus,
    telemetry: Arc<Telemetry>,
    default_timeout: Duration,
    next_id: AtomicU64,
    this: Weak<CallDispatcher>,
}

impl CallDispatcher {
    /// Builds the dispatcher together with the worker pool it feeds. The pool
    /// only holds a weak reference back, so dropping the dispatcher tears
    /// both down.
    pub fn with_pool(params: DispatchParams) -> Arc<Self> {
        let DispatchParams {
            registry,
            executor,
            events,
            telemetry,
            generation,
            shutdown,
            settings,
            default_timeout,
        } = params;

        Arc::new_cyclic(|this: &Weak<CallDispatcher>| {
            let pool = Arc::new(WorkerPool::new(WorkerPoolParams {
                registry: Arc::clone(&registry),
                executor,
                dispatcher: this.clone(),
                events: events.clone(),
                telemetry: Arc::clone(&telemetry),
                generation,
                shutdown,
                settings,
            }));

            Self {
                state: Mutex::new(DispatcherState::default()),
                pool,
                registry,
                events,
                telemetry,
                default_timeout,
                next_id: AtomicU64::new(1),
                this: this.clone(),
            }
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Records a new call against `network` and queues it for the pool.
    ///
    /// `timeout` defaults to the configured call timeout.
    pub fn request(
        &self,
        network: &NetworkId,
        payload: CallPayload,
        timeout: Option<Duration>,
    ) -> Result<CallHandle, BalancerError> {
        if lock(&self.state).closed {
            return Err(BalancerError::ShuttingDown);
        }
        if !self.registry.has_nodes(network) {
            return Err(BalancerError::UnknownNetwork {
                network: network.clone(),
            });
        }

        let id = CallId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let submitted_at = Instant::now();
        let deadline = submitted_at + timeout.unwrap_or(self.default_timeout);
        let payload = Arc::new(payload);
        let (status_tx, status_rx) = watch::channel(CallStatus::Requested);
        let (result_tx, result_rx) = oneshot::channel();

        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(BalancerError::ShuttingDown);
            }
            state.calls.insert(
                id,
                CallRecord {
                    network: network.clone(),
                    payload: Arc::clone(&payload),
                    attempt: 0,
                    running: false,
                    submitted_at,
                    deadline,
                    status_tx,
                    result_tx: Some(result_tx),
                    timer: None,
                },
            );
        }

        self.telemetry.record_call_requested();
        tracing::debug!(call = %id, network = %network, method = %payload.method, "call requested");
        self.events.emit(BalancerEvent::NodeCallRequested {
            call: id,
            network: network.clone(),
        });

        let timer = self.arm_deadline(id, deadline);
        match lock(&self.state).calls.get_mut(&id) {
            Some(record) => record.timer = Some(timer),
            None => timer.abort(),
        }

        let queued = QueuedCall {
            id,
            network: network.clone(),
            payload,
            deadline,
            attempt: 0,
        };
        if !self.pool.submit(queued) {
            self.complete(id, 0, Err(BalancerError::ShuttingDown));
        }

        Ok(CallHandle {
            id,
            network: network.clone(),
            status: status_rx,
            result: result_rx,
            dispatcher: self.this.clone(),
        })
    }

    /// Cancels a pending call. A queued call is taken off the queue; a running
    /// call settles as failed at once while its worker keeps going and has its
    /// eventual report discarded.
    pub fn cancel(&self, call: CallId) -> bool {
        let running = {
            let mut state = lock(&self.state);
            let Some(record) = state.calls.remove(&call) else {
                return false;
            };
            let running = record.running;
            self.finish(call, record, Err(BalancerError::Cancelled));
            running
        };

        if running {
            tracing::info!(call = %call, "call cancelled while running; worker result will be discarded");
        } else {
            self.pool.remove_queued(call);
        }
        true
    }

    /// Applies a worker's terminal report. Only the first terminal transition
    /// counts; duplicate reports and reports from an earlier attempt of a
    /// requeued call are ignored.
    pub fn complete(&self, call: CallId, attempt: u32, result: CallResult) -> bool {
        let mut state = lock(&self.state);
        let Some(record) = state.calls.get(&call) else {
            if state.reported.contains(&(call, attempt)) {
                self.telemetry.record_anomalous_report();
                tracing::warn!(call = %call, attempt, "duplicate terminal report for settled call");
            } else {
                // Lost the race against a cancel, the deadline or shutdown.
                tracing::debug!(call = %call, attempt, "ignoring report for settled call");
            }
            return false;
        };
        if record.attempt != attempt {
            self.telemetry.record_anomalous_report();
            tracing::warn!(
                call = %call,
                attempt,
                current_attempt = record.attempt,
                "terminal report from stale attempt"
            );
            return false;
        }

        let Some(record) = state.calls.remove(&call) else {
            return false;
        };
        if state.reported.len() >= REPORTED_HISTORY {
            state.reported.pop_front();
        }
        state.reported.push_back((call, attempt));
        self.finish(call, record, result);
        true
    }

    /// Deadline timer callback.
    pub fn expire(&self, call: CallId) -> bool {
        {
            let mut state = lock(&self.state);
            let Some(mut record) = state.calls.remove(&call) else {
                return false;
            };
            // The timer is the caller; nothing to abort.
            record.timer = None;
            self.finish(call, record, Err(BalancerError::Timeout));
        }
        self.pool.remove_queued(call);
        true
    }

    /// Waits until every call pending on `network` right now has settled.
    /// Calls requested after this returns its future are not waited on.
    pub async fn drain(&self, network: &NetworkId) -> usize {
        let mut pending: Vec<watch::Receiver<CallStatus>> = lock(&self.state)
            .calls
            .values()
            .filter(|record| &record.network == network)
            .map(|record| record.status_tx.subscribe())
            .collect();

        let count = pending.len();
        if count > 0 {
            tracing::info!(network = %network, pending = count, "draining in-flight calls");
        }
        join_all(pending.iter_mut().map(|status| async move {
            let _ = status.wait_for(CallStatus::is_terminal).await;
        }))
        .await;
        count
    }

    /// Settles every pending call with `error` and refuses new requests.
    pub fn fail_all(&self, error: BalancerError) -> usize {
        let mut state = lock(&self.state);
        state.closed = true;
        let calls: Vec<(CallId, CallRecord)> = state.calls.drain().collect();
        let count = calls.len();
        for (id, record) in calls {
            self.finish(id, record, Err(error.clone()));
        }
        count
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).calls.len()
    }

    pub fn pending_on(&self, network: &NetworkId) -> usize {
        lock(&self.state)
            .calls
            .values()
            .filter(|record| &record.network == network)
            .count()
    }

    /// Binds a queued call to a worker. Called by the pool under its lock.
    pub(crate) fn begin(&self, call: CallId, attempt: u32) -> bool {
        let mut state = lock(&self.state);
        match state.calls.get_mut(&call) {
            Some(record) if record.attempt == attempt && !record.running => {
                record.running = true;
                true
            }
            _ => false,
        }
    }

    /// Prepares a call whose worker was killed for another pass through the
    /// queue. Returns `None` if it already settled or its deadline passed.
    pub(crate) fn requeue(&self, call: CallId, attempt: u32) -> Option<QueuedCall> {
        let mut state = lock(&self.state);
        let record = state.calls.get_mut(&call)?;
        if record.attempt != attempt || record.deadline <= Instant::now() {
            return None;
        }
        record.attempt += 1;
        record.running = false;
        tracing::debug!(call = %call, attempt = record.attempt, "call requeued after flush");

        Some(QueuedCall {
            id: call,
            network: record.network.clone(),
            payload: Arc::clone(&record.payload),
            deadline: record.deadline,
            attempt: record.attempt,
        })
    }

    fn arm_deadline(&self, call: CallId, deadline: Instant) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(dispatcher) = this.upgrade() {
                dispatcher.expire(call);
            }
        })
    }

    fn finish(&self, id: CallId, mut record: CallRecord, result: CallResult) {
        if let Some(timer) = record.timer.take() {
            timer.abort();
        }

        let status = CallStatus::of(&result);
        let elapsed_ms = record.submitted_at.elapsed().as_millis() as u64;
        let network = record.network.clone();
        let event = match &result {
            Ok(_) => {
                self.telemetry.record_call_succeeded();
                tracing::debug!(call = %id, network = %network, elapsed_ms, "call succeeded");
                BalancerEvent::NodeCallSucceeded { call: id, network }
            }
            Err(BalancerError::Timeout) => {
                self.telemetry.record_call_timeout();
                tracing::warn!(call = %id, network = %network, elapsed_ms, "call timed out");
                BalancerEvent::NodeCallTimeout { call: id, network }
            }
            Err(err) => {
                if matches!(err, BalancerError::Cancelled) {
                    self.telemetry.record_call_cancelled();
                } else {
                    self.telemetry.record_call_failed();
                }
                tracing::warn!(call = %id, network = %network, elapsed_ms, error = %err, "call failed");
                BalancerEvent::NodeCallFailed {
                    call: id,
                    network,
                    error: err.to_string(),
                }
            }
        };

        self.events.emit(event);
        record.status_tx.send_replace(status);
        if let Some(result_tx) = record.result_tx.take() {
            // The caller may have dropped its handle.
            let _ = result_tx.send(result);
        }
    }
}
