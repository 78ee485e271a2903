use crate::pool::WorkerPool;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters for call outcomes, node failures and pool churn.
#[derive(Default, Debug)]
pub struct Telemetry {
    calls_requested: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    calls_timed_out: AtomicU64,
    calls_cancelled: AtomicU64,
    node_failures: AtomicU64,
    anomalous_reports: AtomicU64,
    flushes: AtomicU64,
    worker_pool_transitions: AtomicU64,
    worker_pool_size: AtomicUsize,
}

impl Telemetry {
    pub fn record_call_requested(&self) {
        self.calls_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_succeeded(&self) {
        self.calls_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_failed(&self) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_timeout(&self) {
        self.calls_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Cancellation ends a call as failed, so both counters move.
    pub fn record_call_cancelled(&self) {
        self.calls_cancelled.fetch_add(1, Ordering::Relaxed);
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_failure(&self) {
        self.node_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A terminal report that arrived for a call already settled by a report,
    /// or for an attempt that is no longer current.
    pub fn record_anomalous_report(&self) {
        self.anomalous_reports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_pool_size(&self, workers: usize) {
        self.worker_pool_size.store(workers, Ordering::Relaxed);
        self.worker_pool_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            calls_requested: self.calls_requested.load(Ordering::Relaxed),
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            calls_timed_out: self.calls_timed_out.load(Ordering::Relaxed),
            calls_cancelled: self.calls_cancelled.load(Ordering::Relaxed),
            node_failures: self.node_failures.load(Ordering::Relaxed),
            anomalous_reports: self.anomalous_reports.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            worker_pool_size: self.worker_pool_size.load(Ordering::Relaxed),
        }
    }

    pub fn calls_requested(&self) -> u64 {
        self.calls_requested.load(Ordering::Relaxed)
    }

    pub fn node_failures(&self) -> u64 {
        self.node_failures.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size.load(Ordering::Relaxed)
    }

    pub fn worker_pool_transitions(&self) -> u64 {
        self.worker_pool_transitions.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub calls_requested: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_timed_out: u64,
    pub calls_cancelled: u64,
    pub node_failures: u64,
    pub anomalous_reports: u64,
    pub flushes: u64,
    pub worker_pool_size: usize,
}

impl TelemetrySnapshot {
    /// Calls that reached a terminal status.
    pub fn calls_settled(&self) -> u64 {
        self.calls_succeeded + self.calls_failed + self.calls_timed_out
    }
}

/// Spawns a background task that periodically logs call throughput, queue depth and failures.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "nodebalancer::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let settled_delta = current_snapshot
                        .calls_settled()
                        .saturating_sub(last_snapshot.calls_settled());
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        settled_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "nodebalancer::metrics",
                        throughput = format!("{throughput:.2}"),
                        requested = current_snapshot.calls_requested,
                        succeeded = current_snapshot.calls_succeeded,
                        failed = current_snapshot.calls_failed,
                        timed_out = current_snapshot.calls_timed_out,
                        cancelled = current_snapshot.calls_cancelled,
                        node_failures = current_snapshot.node_failures,
                        anomalous_reports = current_snapshot.anomalous_reports,
                        flushes = current_snapshot.flushes,
                        workers = current_snapshot.worker_pool_size,
                        queued = pool.queue_len(),
                        generation = pool.generation(),
                        "balancer metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
