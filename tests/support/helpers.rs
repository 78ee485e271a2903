use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use nodebalancer::{BalancerConfig, BalancerConfigBuilder, BalancerEvent, EventReceiver};
use once_cell::sync::Lazy;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Builder preloaded with short timings so tests never wait on defaults.
pub fn fast_config() -> BalancerConfigBuilder {
    BalancerConfig::builder()
        .pool_size(2)
        .call_timeout(Duration::from_secs(2))
        .no_node_backoff(Duration::from_millis(10))
        .probe_interval(Duration::from_secs(60))
        .probe_timeout(Duration::from_millis(200))
        .metrics_interval(Duration::from_secs(60))
}

/// Receives events until one matches `predicate`.
pub async fn wait_for_event<F>(
    events: &mut EventReceiver,
    timeout: Duration,
    mut predicate: F,
) -> Result<BalancerEvent>
where
    F: FnMut(&BalancerEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if predicate(&event) => return Ok(event),
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => bail!("event bus closed"),
            Err(_) => bail!("no matching event within {timeout:?}"),
        }
    }
}

/// Everything already buffered on `events`, without waiting.
pub fn drain_events(events: &mut EventReceiver) -> Vec<BalancerEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return drained,
        }
    }
}

pub async fn wait_until<F>(description: &str, timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }

        if start.elapsed() > timeout {
            bail!("{description} did not happen within {timeout:?}");
        }

        sleep(Duration::from_millis(10)).await;
    }
}
