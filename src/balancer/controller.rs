//! Balancer controller.
//!
//! `Balancer` is the single entry point callers hold. It wires the registry,
//! dispatcher and worker pool together, owns the active network and the
//! AUTO/MANUAL mode, and is the only place that flushes the pool.

use super::lifecycle::{LifecycleHandles, LifecycleSpawnParams};
use super::state::{BalancerMode, BalancerState};
use crate::dispatch::{CallDispatcher, CallHandle, CallPayload, CallResult, DispatchParams};
use crate::error::BalancerError;
use crate::events::{BalancerEvent, EventBus, EventReceiver};
use crate::pool::{FlushScope, WorkerSettings, WorkerSnapshot};
use crate::registry::{HealthProber, NetworkId, NodeId, NodeRegistry, NodeSnapshot, Removal};
use crate::runtime::config::BalancerConfig;
use crate::runtime::executor::CallExecutor;
use crate::runtime::telemetry::{Telemetry, TelemetrySnapshot};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// Cheaply cloneable handle to a running balancer.
#[derive(Clone)]
pub struct Balancer {
    inner: Arc<BalancerInner>,
}

pub(crate) struct BalancerInner {
    config: BalancerConfig,
    registry: Arc<NodeRegistry>,
    dispatcher: Arc<CallDispatcher>,
    prober: Arc<HealthProber>,
    events: EventBus,
    telemetry: Arc<Telemetry>,
    generation: Arc<AtomicU64>,
    state: BalancerState,
    shutdown_root: CancellationToken,
    lifecycle: AsyncMutex<Option<LifecycleHandles>>,
    switch_lock: AsyncMutex<()>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Balancer {
    /// Builds a balancer and registers every configured node as offline.
    /// Nothing runs until [`Balancer::start`].
    pub fn new(config: BalancerConfig, executor: Arc<dyn CallExecutor>) -> Result<Self> {
        let events = EventBus::new(config.event_capacity());
        let registry = Arc::new(NodeRegistry::new(config.failure_threshold(), events.clone()));
        for (network, endpoints) in config.networks() {
            for endpoint in endpoints {
                registry
                    .add_node(network, endpoint.as_str())
                    .with_context(|| format!("failed to register {endpoint} on network {network}"))?;
            }
        }

        let telemetry = Arc::new(Telemetry::default());
        let generation = Arc::new(AtomicU64::new(0));
        let shutdown_root = CancellationToken::new();
        let dispatcher = CallDispatcher::with_pool(DispatchParams {
            registry: Arc::clone(&registry),
            executor: Arc::clone(&executor),
            events: events.clone(),
            telemetry: Arc::clone(&telemetry),
            generation: Arc::clone(&generation),
            shutdown: shutdown_root.clone(),
            settings: WorkerSettings::from_config(&config),
            default_timeout: config.call_timeout(),
        });
        let prober = Arc::new(HealthProber::new(
            Arc::clone(&registry),
            executor,
            config.probe_timeout(),
        ));
        let state = BalancerState::new(config.initial_mode(), config.default_network().clone());

        Ok(Self {
            inner: Arc::new(BalancerInner {
                config,
                registry,
                dispatcher,
                prober,
                events,
                telemetry,
                generation,
                state,
                shutdown_root,
                lifecycle: AsyncMutex::new(None),
                switch_lock: AsyncMutex::new(()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Probes every node once, spawns the worker pool and starts the
    /// background tasks. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            bail!("balancer has been shut down");
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let promoted = inner.prober.probe_all().await;
        let pool = inner.dispatcher.pool();
        pool.spawn(inner.config.pool_size().saturating_sub(pool.size()));

        let lifecycle = LifecycleHandles::spawn(LifecycleSpawnParams {
            shutdown_root: &inner.shutdown_root,
            telemetry: Arc::clone(&inner.telemetry),
            pool: Arc::clone(pool),
            metrics_interval: inner.config.metrics_interval(),
            prober: Arc::clone(&inner.prober),
            probe_interval: inner.config.probe_interval(),
            balancer: Arc::downgrade(inner),
            events: inner.events.subscribe(),
        });
        *inner.lifecycle.lock().await = Some(lifecycle);

        tracing::info!(
            network = %inner.state.active(),
            mode = ?inner.state.mode(),
            workers = pool.size(),
            nodes_online = promoted,
            "balancer started"
        );
        Ok(())
    }

    /// Kills every worker, fails all pending calls with `ShuttingDown` and
    /// waits for the background tasks to stop.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.shutdown_root.cancel();
        inner.dispatcher.pool().shutdown();
        let failed = inner.dispatcher.fail_all(BalancerError::ShuttingDown);

        let lifecycle = inner.lifecycle.lock().await.take();
        if let Some(lifecycle) = lifecycle {
            lifecycle.shutdown().await;
        }
        tracing::info!(failed_calls = failed, "balancer shut down");
    }

    pub fn set_mode(&self, mode: BalancerMode) {
        let inner = &self.inner;
        let previous = inner.state.set_mode(mode);
        inner.events.emit(match mode {
            BalancerMode::Auto => BalancerEvent::BalancerAuto,
            BalancerMode::Manual => BalancerEvent::BalancerManual,
        });
        tracing::info!(mode = ?mode, previous = ?previous, "balancer mode set");

        // Entering AUTO in the middle of an outage does not wait for the next
        // offline transition.
        if mode == BalancerMode::Auto && previous != BalancerMode::Auto {
            inner.handle_outage(None);
        }
    }

    /// Replaces idle workers and those serving the active network, failing
    /// or requeueing their calls. Workers busy on other networks are left
    /// alone. Always advances the generation; returns the new one.
    pub fn flush(&self) -> u64 {
        self.inner.flush(FlushScope::Network, true)
    }

    /// Makes `target` the active network once in-flight calls on the current
    /// one have settled. Only idle workers are replaced, so no running call
    /// is cancelled. Concurrent switches run one after another.
    pub async fn switch_network(&self, target: impl Into<NetworkId>) -> Result<u64, BalancerError> {
        let inner = &self.inner;
        let target = target.into();
        let _guard = inner.switch_lock.lock().await;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(BalancerError::ShuttingDown);
        }
        if !inner.registry.has_nodes(&target) {
            return Err(BalancerError::UnknownNetwork { network: target });
        }

        let from = inner.state.active();
        tracing::info!(from = %from, to = %target, "network switch requested");
        inner.events.emit(BalancerEvent::NetworkSwitchRequested {
            from: from.clone(),
            to: target.clone(),
        });

        let drained = inner.dispatcher.drain(&from).await;
        inner.state.set_active(target.clone());
        let generation = inner.flush(FlushScope::Idle, false);
        let promoted = inner.prober.probe_network(&target).await;

        tracing::info!(
            from = %from,
            to = %target,
            generation,
            drained,
            nodes_promoted = promoted,
            "network switch complete"
        );
        inner.events.emit(BalancerEvent::NetworkSwitchSucceeded {
            from,
            to: target,
            generation,
        });
        Ok(generation)
    }

    /// Submits a call; the result arrives through the returned handle.
    pub fn request(
        &self,
        network: &NetworkId,
        payload: CallPayload,
        timeout: Option<Duration>,
    ) -> Result<CallHandle, BalancerError> {
        self.inner.dispatcher.request(network, payload, timeout)
    }

    /// Submits a call against the active network and waits for its result.
    pub async fn call(&self, payload: CallPayload) -> CallResult {
        let network = self.inner.state.active();
        self.request(&network, payload, None)?.wait().await
    }

    /// Registers a node. It stays offline until a probe succeeds; once the
    /// balancer runs, a probe is scheduled right away.
    pub fn add_node(
        &self,
        network: impl Into<NetworkId>,
        endpoint: impl Into<String>,
    ) -> Result<NodeId, BalancerError> {
        let network = network.into();
        let id = self.inner.registry.add_node(&network, endpoint)?;
        self.inner.spawn_probe(network);
        Ok(id)
    }

    pub fn remove_node(&self, network: &NetworkId, node: NodeId) -> Result<Removal, BalancerError> {
        self.inner.registry.remove_node(network, node)
    }

    pub fn mark_online(&self, node: NodeId) -> Result<(), BalancerError> {
        self.inner.registry.mark_online(node)
    }

    pub fn mark_offline(&self, node: NodeId) -> Result<(), BalancerError> {
        self.inner.registry.mark_offline(node)
    }

    /// Changes the worker count of the current generation.
    pub fn resize(&self, size: usize) {
        self.inner.dispatcher.pool().resize(size);
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn mode(&self) -> BalancerMode {
        self.inner.state.mode()
    }

    pub fn active_network(&self) -> NetworkId {
        self.inner.state.active()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn networks(&self) -> Vec<NetworkId> {
        self.inner.registry.networks()
    }

    pub fn nodes(&self, network: &NetworkId) -> Vec<NodeSnapshot> {
        self.inner.registry.nodes(network)
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.inner.dispatcher.pool().workers()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.dispatcher.pending()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.inner.telemetry.snapshot()
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.inner.config
    }
}

impl BalancerInner {
    fn flush(&self, scope: FlushScope, probe: bool) -> u64 {
        let network = self.state.active();
        let generation = self.dispatcher.pool().flush(&network, scope);
        self.telemetry.record_flush();
        self.events.emit(BalancerEvent::BalancerFlush {
            network: network.clone(),
            generation,
        });
        if probe {
            self.spawn_probe(network);
        }
        generation
    }

    /// Flushes when running in AUTO mode and the active network has no online
    /// node left. `network` narrows the check to an outage on that network.
    pub(super) fn handle_outage(&self, network: Option<&NetworkId>) {
        if self.state.mode() != BalancerMode::Auto
            || !self.started.load(Ordering::SeqCst)
            || self.closed.load(Ordering::SeqCst)
        {
            return;
        }

        let active = self.state.active();
        if network.is_some_and(|network| network != &active) {
            return;
        }
        if self.registry.online_count(&active) > 0 || !self.registry.has_nodes(&active) {
            return;
        }

        tracing::warn!(network = %active, "active network has no online node; flushing");
        self.flush(FlushScope::Network, true);
    }

    fn spawn_probe(&self, network: NetworkId) {
        if !self.started.load(Ordering::SeqCst) || self.shutdown_root.is_cancelled() {
            return;
        }

        let prober = Arc::clone(&self.prober);
        let shutdown = self.shutdown_root.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                promoted = prober.probe_network(&network) => {
                    if promoted > 0 {
                        tracing::info!(network = %network, promoted, "probe restored nodes");
                    }
                }
            }
        });
    }
}

impl Drop for BalancerInner {
    fn drop(&mut self) {
        self.shutdown_root.cancel();
    }
}
