//! Node failure and re-replication against real nodes.

use std::time::Duration;

use replfs_cluster::{now_ms, NodeId, RecoveryState};

use crate::harness::TestCluster;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_failed_node_replicas_move_to_spare() {
    let mut cluster = TestCluster::start(&["a", "b", "c"], 3).await.unwrap();
    cluster.client().upload_bytes("doc.txt", b"keep me safe").await.unwrap();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("doc.txt").len() == 3).await);

    cluster.add_node("d").await.unwrap();
    cluster.stop_node("a").await;
    let summary = cluster.state().monitor.probe_all().await;
    assert_eq!(summary.unhealthy_nodes, 1);

    let expected: std::collections::BTreeSet<String> =
        ["b", "c", "d"].iter().map(|s| s.to_string()).collect();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("doc.txt") == expected).await);
    assert_eq!(cluster.node("d").file("doc.txt").unwrap(), b"keep me safe");
    assert!(
        cluster
            .wait_until(WAIT, |c| c.state().controller.state(&NodeId::new("a"))
                == Some(RecoveryState::Healthy))
            .await
    );
    assert_eq!(cluster.state().controller.recoveries_started(), 1);

    let (health, _) = cluster.client().node_health().await.unwrap();
    assert_eq!(health.healthy_nodes, 3);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_repeated_failure_inside_cooldown_starts_one_recovery() {
    let mut cluster = TestCluster::start(&["a", "b"], 2).await.unwrap();
    cluster.client().upload_bytes("f", b"x").await.unwrap();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("f").len() == 2).await);

    cluster.stop_node("a").await;
    cluster.state().monitor.probe_all().await;
    let id = NodeId::new("a");
    assert!(
        cluster
            .wait_until(WAIT, |c| c.state().controller.recoveries_started() == 1
                && c.state().controller.state(&id) == Some(RecoveryState::Unhealthy))
            .await
    );

    // Flap the node: a second failure event arrives inside the cooldown.
    cluster.state().registry.mark_healthy(&id);
    cluster.state().registry.mark_unhealthy(&id);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.state().controller.recoveries_started(), 1);

    let summary = cluster.client().recover(Some("a")).await.unwrap();
    assert!(summary.reports.is_empty());
    assert_eq!(summary.in_cooldown, vec![id]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_restores_node() {
    let mut cluster = TestCluster::start(&["a", "b"], 1).await.unwrap();
    cluster.stop_node("b").await;
    cluster.state().monitor.probe_all().await;
    assert!(!cluster.state().registry.is_healthy(&NodeId::new("b")));

    cluster.client().heartbeat("b", Some(42)).await.unwrap();
    let node = cluster.state().registry.get(&NodeId::new("b")).unwrap();
    assert!(node.is_healthy());
    assert_eq!(node.available_space, 42);

    // A heartbeat far in the past of the window expires the node again.
    let expired = cluster.state().monitor.sweep_expired(now_ms() + 8_000_000);
    assert_eq!(expired.len(), 2);
    cluster.shutdown().await;
}
