use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::support::executor::ScriptedExecutor;
use crate::support::helpers::{drain_events, fast_config, init_tracing, wait_for_event, wait_until};
use anyhow::{anyhow, Result};
use futures::future::join_all;
use nodebalancer::{
    Balancer, BalancerError, BalancerEvent, BalancerMode, CallPayload, CallStatus, FnExecutor,
    NetworkId, NodeHealth, NodeTarget,
};
use serde_json::{json, Value};

fn payload() -> CallPayload {
    CallPayload::new("eth_blockNumber", json!([]))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn calls_spread_over_healthy_nodes_all_succeed() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.respond_after("http://a1", Duration::from_millis(10));
    executor.respond_after("http://a2", Duration::from_millis(10));

    let config = fast_config()
        .network("A", ["http://a1", "http://a2"])
        .default_network("A")
        .call_timeout(Duration::from_millis(500))
        .build()?;
    let balancer = Balancer::new(config, executor.clone())?;
    balancer.start().await?;

    let network = NetworkId::from("A");
    let handles = (0..3)
        .map(|_| balancer.request(&network, payload(), None))
        .collect::<Result<Vec<_>, _>>()?;
    let statuses: Vec<_> = handles.iter().map(|handle| handle.watch_status()).collect();

    let results = tokio::time::timeout(
        Duration::from_secs(5),
        join_all(handles.into_iter().map(|handle| handle.wait())),
    )
    .await?;
    for result in results {
        assert_eq!(result?["method"], "eth_blockNumber");
    }
    assert!(statuses
        .iter()
        .all(|status| *status.borrow() == CallStatus::Succeeded));

    let nodes = balancer.nodes(&network);
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|node| node.health == NodeHealth::Online));
    assert_eq!(balancer.telemetry().calls_succeeded, 3);

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_node_goes_offline_after_threshold() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.fail("http://a1");

    let config = fast_config()
        .network("A", ["http://a1"])
        .default_network("A")
        .failure_threshold(3)
        .initial_mode(BalancerMode::Manual)
        .build()?;
    let balancer = Balancer::new(config, executor.clone())?;
    balancer.start().await?;

    // The initial probe fails, so bring the node up by hand.
    let network = NetworkId::from("A");
    let node = balancer.nodes(&network)[0].id;
    balancer.mark_online(node)?;
    let mut events = balancer.subscribe();

    for attempt in 1..=3 {
        let err = balancer
            .request(&network, payload(), None)?
            .wait()
            .await
            .unwrap_err();
        assert!(
            matches!(err, BalancerError::UnderlyingCallError { .. }),
            "call {attempt} failed with {err}"
        );
    }

    let nodes = balancer.nodes(&network);
    let snapshot = &nodes[0];
    assert_eq!(snapshot.health, NodeHealth::Offline);
    assert_eq!(snapshot.consecutive_failures, 3);
    assert!(drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, BalancerEvent::NodeOffline { node: id, .. } if *id == node)));

    let err = balancer
        .request(&network, payload(), None)?
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::NoAvailableNodes { .. }));
    assert_eq!(executor.calls_to("http://a1"), 3);

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_node_stays_offline_through_auto_flush() -> Result<()> {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = Arc::new(FnExecutor::new({
        let calls = Arc::clone(&calls);
        move |node: NodeTarget, _payload: CallPayload| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Value, _>(anyhow!("{} answered 503", node.endpoint)) }
        }
    }));

    let config = fast_config()
        .network("A", ["http://a1"])
        .default_network("A")
        .failure_threshold(3)
        .build()?;
    let balancer = Balancer::new(config, executor)?;
    balancer.start().await?;
    assert_eq!(balancer.mode(), BalancerMode::Auto);

    let network = NetworkId::from("A");
    assert_eq!(balancer.nodes(&network)[0].health, NodeHealth::Online);
    let mut events = balancer.subscribe();

    for attempt in 1..=3 {
        let err = balancer
            .request(&network, payload(), None)?
            .wait()
            .await
            .unwrap_err();
        assert!(
            matches!(err, BalancerError::UnderlyingCallError { .. }),
            "call {attempt} failed with {err}"
        );
    }

    // The outage flush re-probes the network, but a node without a health
    // check has nothing to prove it recovered.
    wait_for_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, BalancerEvent::BalancerFlush { .. })
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let nodes = balancer.nodes(&network);
    assert_eq!(nodes[0].health, NodeHealth::Offline);
    assert_eq!(nodes[0].consecutive_failures, 3);

    let err = balancer
        .request(&network, payload(), None)?
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::NoAvailableNodes { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(balancer.nodes(&network)[0].health, NodeHealth::Offline);

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn network_switch_waits_for_in_flight_calls() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    executor.hold("http://a1");

    let config = fast_config()
        .network("A", ["http://a1"])
        .network("B", ["http://b1", "http://b2"])
        .default_network("A")
        .build()?;
    let balancer = Balancer::new(config, executor.clone())?;
    balancer.start().await?;
    let mut events = balancer.subscribe();

    let network_a = NetworkId::from("A");
    let first = balancer.request(&network_a, payload(), None)?;
    let second = balancer.request(&network_a, payload(), None)?;
    wait_until("both calls reach the node", Duration::from_secs(2), || {
        executor.started() == 2
    })
    .await?;

    let switch = tokio::spawn({
        let balancer = balancer.clone();
        async move { balancer.switch_network("B").await }
    });
    wait_for_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, BalancerEvent::NetworkSwitchRequested { .. })
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!switch.is_finished());
    assert_eq!(balancer.active_network(), network_a);

    executor.release();
    let generation = tokio::time::timeout(Duration::from_secs(5), switch).await???;

    assert!(first.wait().await.is_ok());
    assert!(second.wait().await.is_ok());
    assert_eq!(balancer.active_network(), NetworkId::from("B"));
    assert_eq!(generation, 1);
    assert_eq!(balancer.generation(), generation);
    assert!(balancer
        .workers()
        .iter()
        .all(|worker| worker.generation == generation));

    let succeeded = wait_for_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, BalancerEvent::NetworkSwitchSucceeded { .. })
    })
    .await?;
    assert_eq!(
        succeeded,
        BalancerEvent::NetworkSwitchSucceeded {
            from: network_a,
            to: NetworkId::from("B"),
            generation,
        }
    );

    let value = balancer.call(payload()).await?;
    assert!(value["endpoint"].as_str().unwrap_or_default().starts_with("http://b"));

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auto_mode_flushes_when_last_node_goes_offline() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let config = fast_config()
        .network("A", ["http://a1"])
        .default_network("A")
        .build()?;
    let balancer = Balancer::new(config, executor)?;
    balancer.start().await?;
    let mut events = balancer.subscribe();

    let node = balancer.nodes(&NetworkId::from("A"))[0].id;
    balancer.mark_offline(node)?;

    let flush = wait_for_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, BalancerEvent::BalancerFlush { .. })
    })
    .await?;
    assert_eq!(
        flush,
        BalancerEvent::BalancerFlush {
            network: NetworkId::from("A"),
            generation: 1,
        }
    );
    assert_eq!(balancer.telemetry().flushes, 1);

    balancer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_mode_leaves_workers_alone_during_outage() -> Result<()> {
    init_tracing();
    let executor = ScriptedExecutor::new();
    let config = fast_config()
        .network("A", ["http://a1"])
        .default_network("A")
        .initial_mode(BalancerMode::Manual)
        .build()?;
    let balancer = Balancer::new(config, executor)?;
    balancer.start().await?;
    let mut events = balancer.subscribe();

    let node = balancer.nodes(&NetworkId::from("A"))[0].id;
    balancer.mark_offline(node)?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, BalancerEvent::BalancerFlush { .. })));
    assert_eq!(balancer.generation(), 0);

    // Switching to AUTO while the outage lasts flushes right away.
    balancer.set_mode(BalancerMode::Auto);
    assert_eq!(balancer.generation(), 1);
    let names: Vec<_> = drain_events(&mut events)
        .iter()
        .map(BalancerEvent::name)
        .collect();
    assert_eq!(&names[..1], &["BALANCER_AUTO"]);
    assert!(names.contains(&"BALANCER_FLUSH"));

    balancer.shutdown().await;
    Ok(())
}
