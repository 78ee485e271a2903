use crate::balancer::BalancerMode;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::registry::{NetworkId, DEFAULT_FAILURE_THRESHOLD};
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_NO_NODE_BACKOFF_MS: u64 = 50;
const DEFAULT_NO_NODE_ATTEMPTS: usize = 3;
const DEFAULT_MAX_NODE_ATTEMPTS: usize = 3;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 30;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Runtime configuration for a [`Balancer`](crate::Balancer).
///
/// All instances must be constructed via [`BalancerConfig::builder`] or [`BalancerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerConfig {
    networks: BTreeMap<NetworkId, Vec<String>>,
    default_network: NetworkId,
    pool_size: usize,
    failure_threshold: u32,
    call_timeout: Duration,
    no_node_backoff: Duration,
    no_node_attempts: usize,
    max_node_attempts: usize,
    probe_interval: Duration,
    probe_timeout: Duration,
    metrics_interval: Duration,
    event_capacity: usize,
    initial_mode: BalancerMode,
    requeue_on_flush: bool,
}

pub struct BalancerConfigParams {
    pub networks: BTreeMap<NetworkId, Vec<String>>,
    pub default_network: NetworkId,
    pub pool_size: usize,
    pub failure_threshold: u32,
    pub call_timeout: Duration,
    pub no_node_backoff: Duration,
    pub no_node_attempts: usize,
    pub max_node_attempts: usize,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub metrics_interval: Duration,
    pub event_capacity: usize,
    pub initial_mode: BalancerMode,
    pub requeue_on_flush: bool,
}

impl BalancerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> BalancerConfigBuilder {
        BalancerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`BalancerConfig::builder`] when most values use defaults.
    pub fn new(params: BalancerConfigParams) -> Result<Self> {
        let BalancerConfigParams {
            networks,
            default_network,
            pool_size,
            failure_threshold,
            call_timeout,
            no_node_backoff,
            no_node_attempts,
            max_node_attempts,
            probe_interval,
            probe_timeout,
            metrics_interval,
            event_capacity,
            initial_mode,
            requeue_on_flush,
        } = params;

        let networks = networks
            .into_iter()
            .map(|(network, endpoints)| {
                let endpoints = endpoints
                    .into_iter()
                    .map(|endpoint| endpoint.trim().to_owned())
                    .collect();
                (network, endpoints)
            })
            .collect();

        let config = Self {
            networks,
            default_network,
            pool_size,
            failure_threshold,
            call_timeout,
            no_node_backoff,
            no_node_attempts,
            max_node_attempts,
            probe_interval,
            probe_timeout,
            metrics_interval,
            event_capacity,
            initial_mode,
            requeue_on_flush,
        };

        config.validate()?;
        Ok(config)
    }

    /// Candidate endpoints per network, registered on startup.
    pub fn networks(&self) -> &BTreeMap<NetworkId, Vec<String>> {
        &self.networks
    }

    /// Network that is active when the balancer boots.
    pub fn default_network(&self) -> &NetworkId {
        &self.default_network
    }

    /// Number of concurrent workers per generation.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Consecutive failures after which a node is taken offline.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Deadline applied to calls that do not carry their own timeout.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Wait between node lookups when a network has no online node.
    pub fn no_node_backoff(&self) -> Duration {
        self.no_node_backoff
    }

    pub fn no_node_attempts(&self) -> usize {
        self.no_node_attempts
    }

    /// Distinct nodes tried for one call before it is failed.
    pub fn max_node_attempts(&self) -> usize {
        self.max_node_attempts
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    pub fn initial_mode(&self) -> BalancerMode {
        self.initial_mode
    }

    /// Whether calls bound to flushed workers go back on the queue instead of
    /// failing with `Cancelled`.
    pub fn requeue_on_flush(&self) -> bool {
        self.requeue_on_flush
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            bail!("at least one network must be configured");
        }

        if self.default_network.as_str().is_empty() {
            bail!("default_network cannot be empty");
        }

        if !self.networks.contains_key(&self.default_network) {
            bail!(
                "default_network {} is not one of the configured networks",
                self.default_network
            );
        }

        for (network, endpoints) in &self.networks {
            if network.as_str().is_empty() {
                bail!("network names cannot be empty");
            }
            let mut seen = HashSet::new();
            for endpoint in endpoints {
                if endpoint.is_empty() {
                    bail!("network {network} has an empty endpoint");
                }
                if !seen.insert(endpoint.as_str()) {
                    bail!("network {network} lists endpoint {endpoint} more than once");
                }
            }
        }

        if self.pool_size == 0 {
            bail!("pool_size must be greater than 0");
        }

        if self.failure_threshold == 0 {
            bail!("failure_threshold must be greater than 0");
        }

        if self.call_timeout.is_zero() {
            bail!("call_timeout must be greater than 0");
        }

        if self.no_node_backoff.is_zero() {
            bail!("no_node_backoff must be greater than 0");
        }

        if self.no_node_attempts == 0 {
            bail!("no_node_attempts must be greater than 0");
        }

        if self.max_node_attempts == 0 {
            bail!("max_node_attempts must be greater than 0");
        }

        if self.probe_interval.is_zero() {
            bail!("probe_interval must be greater than 0");
        }

        if self.probe_timeout.is_zero() {
            bail!("probe_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.event_capacity == 0 {
            bail!("event_capacity must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct BalancerConfigBuilder {
    networks: BTreeMap<NetworkId, Vec<String>>,
    default_network: Option<NetworkId>,
    pool_size: Option<usize>,
    failure_threshold: Option<u32>,
    call_timeout: Option<Duration>,
    no_node_backoff: Option<Duration>,
    no_node_attempts: Option<usize>,
    max_node_attempts: Option<usize>,
    probe_interval: Option<Duration>,
    probe_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    event_capacity: Option<usize>,
    initial_mode: Option<BalancerMode>,
    requeue_on_flush: Option<bool>,
}

impl BalancerConfigBuilder {
    /// Adds `endpoints` to `network`. Repeated calls for the same network append.
    pub fn network<I, S>(mut self, network: impl Into<NetworkId>, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.networks
            .entry(network.into())
            .or_default()
            .extend(endpoints.into_iter().map(Into::into));
        self
    }

    pub fn default_network(mut self, network: impl Into<NetworkId>) -> Self {
        self.default_network = Some(network.into());
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn no_node_backoff(mut self, backoff: Duration) -> Self {
        self.no_node_backoff = Some(backoff);
        self
    }

    pub fn no_node_attempts(mut self, attempts: usize) -> Self {
        self.no_node_attempts = Some(attempts);
        self
    }

    pub fn max_node_attempts(mut self, attempts: usize) -> Self {
        self.max_node_attempts = Some(attempts);
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = Some(interval);
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn initial_mode(mut self, mode: BalancerMode) -> Self {
        self.initial_mode = Some(mode);
        self
    }

    pub fn requeue_on_flush(mut self, enabled: bool) -> Self {
        self.requeue_on_flush = Some(enabled);
        self
    }

    pub fn build(self) -> Result<BalancerConfig> {
        let params = BalancerConfigParams {
            networks: self.networks,
            default_network: self
                .default_network
                .context("default_network is required")?,
            pool_size: self.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            failure_threshold: self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            call_timeout: self
                .call_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)),
            no_node_backoff: self
                .no_node_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_NO_NODE_BACKOFF_MS)),
            no_node_attempts: self.no_node_attempts.unwrap_or(DEFAULT_NO_NODE_ATTEMPTS),
            max_node_attempts: self.max_node_attempts.unwrap_or(DEFAULT_MAX_NODE_ATTEMPTS),
            probe_interval: self
                .probe_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS)),
            probe_timeout: self
                .probe_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            event_capacity: self.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY),
            initial_mode: self.initial_mode.unwrap_or_default(),
            requeue_on_flush: self.requeue_on_flush.unwrap_or(false),
        };

        BalancerConfig::new(params)
    }
}
