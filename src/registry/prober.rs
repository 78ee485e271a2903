//! Background health probing of offline nodes.

use super::node::{NetworkId, NodeTarget};
use super::store::NodeRegistry;
use crate::runtime::executor::CallExecutor;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Brings offline nodes back once their health probe succeeds.
pub struct HealthProber {
    registry: Arc<NodeRegistry>,
    executor: Arc<dyn CallExecutor>,
    probe_timeout: Duration,
}

impl HealthProber {
    pub fn new(
        registry: Arc<NodeRegistry>,
        executor: Arc<dyn CallExecutor>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            executor,
            probe_timeout,
        }
    }

    /// Probes every offline node of `network` concurrently and returns how
    /// many were promoted.
    pub async fn probe_network(&self, network: &NetworkId) -> usize {
        let targets = self.registry.offline_targets(network);
        if targets.is_empty() {
            return 0;
        }

        let results = join_all(targets.iter().map(|target| self.probe_one(target))).await;
        let promoted = results.into_iter().filter(|promoted| *promoted).count();
        tracing::debug!(
            network = %network,
            probed = targets.len(),
            promoted,
            "probe round finished"
        );
        promoted
    }

    pub async fn probe_all(&self) -> usize {
        let mut promoted = 0;
        for network in self.registry.networks() {
            promoted += self.probe_network(&network).await;
        }
        promoted
    }

    async fn probe_one(&self, target: &NodeTarget) -> bool {
        let Some(probe) = self.executor.probe(target) else {
            return self.assume_healthy(target);
        };
        match timeout(self.probe_timeout, probe).await {
            Ok(Ok(())) => match self.registry.mark_online(target.id) {
                Ok(()) => true,
                // Removed while the probe was running.
                Err(err) => {
                    tracing::debug!(node = %target.id, error = %err, "probed node vanished");
                    false
                }
            },
            Ok(Err(err)) => {
                tracing::debug!(
                    node = %target.id,
                    endpoint = %target.endpoint,
                    error = %err,
                    "node probe failed"
                );
                false
            }
            Err(_) => {
                tracing::debug!(
                    node = %target.id,
                    endpoint = %target.endpoint,
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "node probe timed out"
                );
                false
            }
        }
    }

    /// Stands in for a probe when the executor has none. Only nodes that never
    /// failed come up; demoted nodes wait for an explicit `mark_online`.
    fn assume_healthy(&self, target: &NodeTarget) -> bool {
        match self.registry.mark_online_if_unfailed(target.id) {
            Ok(promoted) => promoted,
            Err(err) => {
                tracing::debug!(node = %target.id, error = %err, "probed node vanished");
                false
            }
        }
    }

    /// Re-probes offline nodes every `probe_interval`, starting one interval
    /// from now.
    pub fn spawn_probe_loop(
        self: Arc<Self>,
        probe_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + probe_interval, probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        let promoted = self.probe_all().await;
                        if promoted > 0 {
                            tracing::info!(promoted, "health probe restored nodes");
                        }
                    }
                }
            }

            tracing::info!("health prober stopped");
        })
    }
}
