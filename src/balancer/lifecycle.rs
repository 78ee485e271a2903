//! Background tasks that live between `Balancer::start` and `Balancer::shutdown`.

use super::controller::BalancerInner;
use crate::events::{BalancerEvent, EventReceiver};
use crate::pool::WorkerPool;
use crate::registry::HealthProber;
use crate::runtime::telemetry::{self, Telemetry};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    metrics_handle: Option<JoinHandle<()>>,
    probe_handle: Option<JoinHandle<()>>,
    watcher_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LifecycleSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub pool: Arc<WorkerPool>,
    pub metrics_interval: Duration,
    pub prober: Arc<HealthProber>,
    pub probe_interval: Duration,
    pub balancer: Weak<BalancerInner>,
    pub events: EventReceiver,
}

impl LifecycleHandles {
    pub(crate) fn spawn(params: LifecycleSpawnParams<'_>) -> Self {
        let LifecycleSpawnParams {
            shutdown_root,
            telemetry,
            pool,
            metrics_interval,
            prober,
            probe_interval,
            balancer,
            events,
        } = params;

        let run_token = shutdown_root.child_token();
        let metrics_handle =
            telemetry::spawn_metrics_reporter(telemetry, pool, run_token.clone(), metrics_interval);
        let probe_handle = prober.spawn_probe_loop(probe_interval, run_token.clone());
        let watcher_handle = spawn_outage_watcher(balancer, events, run_token.clone());

        Self {
            run_token,
            metrics_handle: Some(metrics_handle),
            probe_handle: Some(probe_handle),
            watcher_handle: Some(watcher_handle),
        }
    }

    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();

        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }

        if let Some(handle) = self.probe_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "health prober task panicked");
            }
        }

        if let Some(handle) = self.watcher_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "outage watcher task panicked");
            }
        }
    }
}

/// Follows node health events and lets the balancer react when a network
/// loses its last online node. Mode checks happen on the balancer side, so
/// the watcher runs in both modes.
fn spawn_outage_watcher(
    balancer: Weak<BalancerInner>,
    mut events: EventReceiver,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => received,
            };

            let network = match received {
                Ok(BalancerEvent::NodeOffline { network, .. }) => Some(network),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "outage watcher lagged behind the event bus");
                    // An offline transition may be among the skipped events.
                    None
                }
                Err(RecvError::Closed) => break,
            };

            let Some(balancer) = balancer.upgrade() else {
                break;
            };
            balancer.handle_outage(network.as_ref());
        }

        tracing::debug!("outage watcher stopped");
    })
}
