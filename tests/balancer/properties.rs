use std::time::Duration;

use crate::support::executor::ScriptedExecutor;
use crate::support::helpers::{drain_events, fast_config, init_tracing, wait_for_event, wait_until};
use anyhow::Result;
use nodebalancer::{
    Balancer, BalancerError, BalancerEvent, BalancerMode, CallPayload, CallStatus, NetworkId,
    NodeHealth, Removal, WorkerState,
};
use serde_json::json;

fn payload() -> CallPayload {
    CallPayload::new("eth_getBalance", json!(["0x0", "latest"]))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removing_a_busy_node_waits_for_its_call() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.hold("http://a1");

    let config = fast_config()
        .network("A", ["http://a1", "http://a2"])
        .default_network("A")
        .initial_mode(BalancerMode::Manual)
        .build()?;
    let balancer = Balancer::new(config, executor.clone())?;
    balancer.start().await?;
    let mut events = balancer.subscribe();

    let network = NetworkId::from("A");
    let busy = balancer
        .nodes(&network)
        .into_iter()
        .find(|node| node.endpoint == "http://a1")
        .map(|node| node.id)
        .expect("a1 registered");

    let held = balancer.request(&network, payload(), None)?;
    wait_until("call reaches a1", Duration::from_secs(2), || {
        executor.calls_to("http://a1") == 1
    })
    .await?;

    assert_eq!(balancer.remove_node(&network, busy)?, Removal::Deferred);
    assert!(!drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, BalancerEvent::NodeRemoved { .. })));

    // A node pending removal is never selected.
    let value = balancer.request(&network, payload(), None)?.wait().await?;
    assert_eq!(value["endpoint"], "http://a2");

    executor.release();
    let result = tokio::time::timeout(Duration::from_secs(2), held.wait()).await?;
    assert_eq!(result?["endpoint"], "http://a1");

    let removed = wait_for_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, BalancerEvent::NodeRemoved { .. })
    })
    .await?;
    assert!(matches!(removed, BalancerEvent::NodeRemoved { node, .. } if node == busy));
    let remaining = balancer.nodes(&network);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].endpoint, "http://a2");

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_beats_slow_node_and_late_success_changes_nothing() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.respond_after("http://a1", Duration::from_millis(300));

    let config = fast_config()
        .network("A", ["http://a1"])
        .default_network("A")
        .initial_mode(BalancerMode::Manual)
        .build()?;
    let balancer = Balancer::new(config, executor)?;
    balancer.start().await?;

    let network = NetworkId::from("A");
    let handle = balancer.request(&network, payload(), Some(Duration::from_millis(50)))?;
    let status = handle.watch_status();
    assert!(matches!(handle.wait().await, Err(BalancerError::Timeout)));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(*status.borrow(), CallStatus::TimedOut);

    let telemetry = balancer.telemetry();
    assert_eq!(telemetry.calls_timed_out, 1);
    assert_eq!(telemetry.calls_succeeded, 0);

    let nodes = balancer.nodes(&network);
    let node = &nodes[0];
    assert_eq!(node.consecutive_failures, 1);
    assert_eq!(node.in_flight, 0);
    assert!(node.last_success.is_none());

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_running_call_settles_it_once() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.hold("http://a1");

    let config = fast_config()
        .network("A", ["http://a1"])
        .default_network("A")
        .build()?;
    let balancer = Balancer::new(config, executor.clone())?;
    balancer.start().await?;

    let network = NetworkId::from("A");
    let handle = balancer.request(&network, payload(), None)?;
    let status = handle.watch_status();
    let canceller = handle.canceller();
    wait_until("call reaches a1", Duration::from_secs(2), || {
        executor.started() == 1
    })
    .await?;

    assert!(canceller.cancel());
    assert!(!canceller.cancel());
    assert!(matches!(handle.wait().await, Err(BalancerError::Cancelled)));
    assert_eq!(*status.borrow(), CallStatus::Failed);

    // The worker still finishes the node call and records the node's health.
    executor.release();
    wait_until("node latency recorded", Duration::from_secs(2), || {
        balancer.nodes(&network)[0].last_latency.is_some()
    })
    .await?;
    assert_eq!(*status.borrow(), CallStatus::Failed);

    let telemetry = balancer.telemetry();
    assert_eq!(telemetry.calls_cancelled, 1);
    assert_eq!(telemetry.calls_succeeded, 0);

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flushed_workers_never_report_into_the_new_generation() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.hold("http://a1");

    let config = fast_config()
        .network("A", ["http://a1"])
        .default_network("A")
        .initial_mode(BalancerMode::Manual)
        .build()?;
    let balancer = Balancer::new(config, executor.clone())?;
    balancer.start().await?;
    let mut events = balancer.subscribe();

    let network = NetworkId::from("A");
    let handle = balancer.request(&network, payload(), None)?;
    wait_until("call reaches a1", Duration::from_secs(2), || {
        executor.started() == 1
    })
    .await?;

    assert_eq!(balancer.flush(), 1);
    assert!(matches!(handle.wait().await, Err(BalancerError::Cancelled)));

    let killed: Vec<u64> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            BalancerEvent::WorkerKilled { generation, .. } => Some(generation),
            _ => None,
        })
        .collect();
    assert_eq!(killed, vec![0, 0]);
    assert!(balancer.workers().iter().all(|worker| worker.generation == 1));

    executor.release();
    wait_until("stale lease released", Duration::from_secs(2), || {
        balancer.nodes(&network)[0].in_flight == 0
    })
    .await?;
    let nodes = balancer.nodes(&network);
    let node = &nodes[0];
    assert!(node.last_success.is_none());
    assert_eq!(node.health, NodeHealth::Online);

    // The fresh generation serves calls as usual.
    let value = balancer.call(payload()).await?;
    assert_eq!(value["endpoint"], "http://a1");

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outage_flush_leaves_calls_on_other_networks_running() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.hold("http://b1");

    let config = fast_config()
        .network("A", ["http://a1"])
        .network("B", ["http://b1"])
        .default_network("A")
        .build()?;
    let balancer = Balancer::new(config, executor.clone())?;
    balancer.start().await?;
    let mut events = balancer.subscribe();

    let network_b = NetworkId::from("B");
    let on_b = balancer.request(&network_b, payload(), None)?;
    let status = on_b.watch_status();
    wait_until("call reaches b1", Duration::from_secs(2), || {
        executor.started() == 1
    })
    .await?;

    let a1 = balancer.nodes(&NetworkId::from("A"))[0].id;
    balancer.mark_offline(a1)?;
    wait_for_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, BalancerEvent::BalancerFlush { .. })
    })
    .await?;
    assert_eq!(balancer.generation(), 1);
    assert_eq!(*status.borrow(), CallStatus::Requested);

    executor.release();
    let value = tokio::time::timeout(Duration::from_secs(2), on_b.wait()).await??;
    assert_eq!(value["endpoint"], "http://b1");
    assert_eq!(balancer.telemetry().calls_cancelled, 0);

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn switching_to_a_busy_network_keeps_its_calls() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.hold("http://b1");

    let config = fast_config()
        .network("A", ["http://a1"])
        .network("B", ["http://b1"])
        .default_network("A")
        .build()?;
    let balancer = Balancer::new(config, executor.clone())?;
    balancer.start().await?;

    let network_b = NetworkId::from("B");
    let on_b = balancer.request(&network_b, payload(), None)?;
    wait_until("call reaches b1", Duration::from_secs(2), || {
        executor.started() == 1
    })
    .await?;

    let generation = tokio::time::timeout(Duration::from_secs(2), balancer.switch_network("B")).await??;
    assert_eq!(generation, 1);
    assert_eq!(balancer.active_network(), network_b);
    assert!(balancer
        .workers()
        .iter()
        .any(|worker| worker.state == WorkerState::Processing(on_b.id())));

    executor.release();
    let value = tokio::time::timeout(Duration::from_secs(2), on_b.wait()).await??;
    assert_eq!(value["endpoint"], "http://b1");
    assert_eq!(balancer.telemetry().calls_cancelled, 0);

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn networks_are_checked_at_request_time() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let config = fast_config()
        .network("A", ["http://a1"])
        .default_network("A")
        .build()?;
    let balancer = Balancer::new(config, executor)?;
    balancer.start().await?;

    let unknown = NetworkId::from("Z");
    assert!(matches!(
        balancer.request(&unknown, payload(), None),
        Err(BalancerError::UnknownNetwork { .. })
    ));

    // Nodes added at runtime are probed and become usable.
    let network = NetworkId::from("C");
    let node = balancer.add_node("C", "http://c1")?;
    assert!(matches!(
        balancer.add_node("C", "http://c1"),
        Err(BalancerError::DuplicateNode { .. })
    ));
    wait_until("added node comes online", Duration::from_secs(2), || {
        balancer
            .nodes(&network)
            .iter()
            .any(|snapshot| snapshot.id == node && snapshot.health == NodeHealth::Online)
    })
    .await?;
    let value = balancer.request(&network, payload(), None)?.wait().await?;
    assert_eq!(value["endpoint"], "http://c1");

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_fails_in_flight_calls() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.hold("http://a1");

    let config = fast_config()
        .network("A", ["http://a1"])
        .default_network("A")
        .build()?;
    let balancer = Balancer::new(config, executor.clone())?;
    balancer.start().await?;

    let network = NetworkId::from("A");
    let first = balancer.request(&network, payload(), None)?;
    let second = balancer.request(&network, payload(), None)?;
    let queued = balancer.request(&network, payload(), None)?;
    wait_until("calls reach a1", Duration::from_secs(2), || {
        executor.started() == 2
    })
    .await?;

    tokio::time::timeout(Duration::from_secs(2), balancer.shutdown()).await?;
    for handle in [first, second, queued] {
        assert!(matches!(handle.wait().await, Err(BalancerError::ShuttingDown)));
    }
    assert!(balancer.workers().is_empty());

    // Aborted workers drop their leases.
    wait_until("leases released", Duration::from_secs(2), || {
        balancer.nodes(&network)[0].in_flight == 0
    })
    .await?;
    Ok(())
}
