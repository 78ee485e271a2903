use super::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition, RetryFailure};
use super::types::{Claim, NodeVerdict, QueuedCall, WorkerId};
use super::worker_pool::{panic_message, WorkerPool};
use crate::error::BalancerError;
use crate::registry::{NodeId, NodeLease};
use anyhow::anyhow;
use futures::future;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// Exponential growth for the no-node backoff stops at this multiple of the
/// initial delay.
const NO_NODE_BACKOFF_CEILING: u32 = 4;

pub(super) struct Worker {
    id: WorkerId,
    generation: u64,
    token: CancellationToken,
    pool: Arc<WorkerPool>,
}

impl Worker {
    pub(super) fn new(
        id: WorkerId,
        generation: u64,
        token: CancellationToken,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            id,
            generation,
            token,
            pool,
        }
    }

    #[tracing::instrument(name = "worker", skip_all, fields(worker = %self.id, generation = self.generation))]
    pub(super) async fn run(self) {
        tracing::debug!("worker task started");

        loop {
            let call = match self.pool.claim(self.id) {
                Claim::Call(call) => call,
                Claim::Retired => break,
                Claim::Empty => {
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = self.pool.work_ready.notified() => continue,
                    }
                }
            };

            if !self.process(call).await {
                break;
            }
        }

        tracing::debug!("worker task stopped");
    }

    /// Runs one call to a terminal result. Returns `false` once the worker
    /// finds out it was retired while the call was in flight.
    async fn process(&self, call: QueuedCall) -> bool {
        let mut lease = match timeout_at(call.deadline, self.acquire(&call)).await {
            Ok(Ok(lease)) => lease,
            Ok(Err(err)) => return self.pool.report(self.id, &call, None, Err(err)),
            Err(_) => {
                return self
                    .pool
                    .report(self.id, &call, None, Err(BalancerError::Timeout));
            }
        };
        let mut tried: Vec<NodeId> = Vec::new();

        loop {
            let started = Instant::now();
            let execution = AssertUnwindSafe(self.pool.executor.execute(lease.target(), &call.payload))
                .catch_unwind();

            let outcome = timeout_at(call.deadline, execution).await;
            let error = match outcome {
                Ok(Ok(Ok(value))) => {
                    let latency = started.elapsed();
                    tracing::debug!(
                        call = %call.id,
                        node = %lease.id(),
                        latency_ms = latency.as_millis() as u64,
                        "node call succeeded"
                    );
                    return self.pool.report(
                        self.id,
                        &call,
                        Some((lease, NodeVerdict::Succeeded(latency))),
                        Ok(value),
                    );
                }
                Ok(Ok(Err(err))) => BalancerError::underlying(lease.endpoint(), err),
                Ok(Err(panic_payload)) => BalancerError::underlying(
                    lease.endpoint(),
                    anyhow!("executor panicked: {}", panic_message(panic_payload.as_ref())),
                ),
                Err(_) => {
                    tracing::warn!(
                        call = %call.id,
                        node = %lease.id(),
                        endpoint = %lease.endpoint(),
                        "node call deadline elapsed"
                    );
                    return self.pool.report(
                        self.id,
                        &call,
                        Some((lease, NodeVerdict::Failed)),
                        Err(BalancerError::Timeout),
                    );
                }
            };

            tried.push(lease.id());
            tracing::warn!(
                call = %call.id,
                node = %lease.id(),
                attempt = tried.len(),
                max_attempts = self.pool.settings.max_node_attempts,
                error = %error,
                "node call failed"
            );

            // The next node is leased before the failure is recorded, so a
            // call with nowhere left to go settles together with the verdict
            // that may take its node offline.
            let next = if tried.len() < self.pool.settings.max_node_attempts {
                self.pool
                    .registry
                    .select_best_node(&call.network, &tried)
                    .ok()
            } else {
                None
            };
            let Some(next) = next else {
                return self.pool.report(
                    self.id,
                    &call,
                    Some((lease, NodeVerdict::Failed)),
                    Err(error),
                );
            };

            if !self.pool.settle_node(self.id, lease, NodeVerdict::Failed) {
                tracing::debug!(call = %call.id, "worker retired mid-call; abandoning retries");
                next.release();
                return false;
            }
            lease = next;
        }
    }

    /// Leases the first node for a call, backing off briefly while the
    /// network has no online node.
    async fn acquire(&self, call: &QueuedCall) -> Result<NodeLease, BalancerError> {
        let registry = &self.pool.registry;
        let settings = self.pool.settings;
        let backoff = RetryBackoff::new(
            settings.no_node_backoff,
            settings.no_node_backoff.saturating_mul(NO_NODE_BACKOFF_CEILING),
        )
        .with_max_attempts(settings.no_node_attempts)
        .with_cancellation(&self.token);

        let result = retry_with_backoff(
            backoff,
            |_| future::ready(registry.select_best_node(&call.network, &[])),
            |attempt, delay, err, will_retry| {
                if will_retry {
                    tracing::debug!(
                        call = %call.id,
                        network = %call.network,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "no node available; backing off"
                    );
                }
            },
            |_, err| match err {
                BalancerError::NoAvailableNodes { .. } => RetryDisposition::Retry,
                _ => RetryDisposition::Abort,
            },
        )
        .await;

        result.map_err(|failure| match failure {
            RetryFailure::Failed(err) => err,
            RetryFailure::Cancelled => BalancerError::Cancelled,
        })
    }
}
