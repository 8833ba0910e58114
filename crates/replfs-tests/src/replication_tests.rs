//! Upload-driven replication against real nodes.

use std::time::Duration;

use replfs_server::ErrorKind;

use crate::harness::TestCluster;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_upload_converges_to_factor() {
    let cluster = TestCluster::start(&["a", "b", "c", "d"], 3).await.unwrap();
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    cluster.client().upload_bytes("data/big.bin", &data).await.unwrap();

    assert!(cluster.wait_until(WAIT, |c| c.replicas("data/big.bin").len() == 3).await);
    let holders = cluster.replicas("data/big.bin");
    for id in &holders {
        assert_eq!(cluster.node(id).file("data/big.bin").unwrap(), data);
    }
    let statuses = cluster.client().replication_status(Some("data/big.bin")).await.unwrap();
    assert_eq!(statuses[0].replica_count(), 3);
    assert_eq!(statuses[0].node_ids.len(), holders.len());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_factor_capped_by_healthy_nodes() {
    let cluster = TestCluster::start(&["a", "b"], 3).await.unwrap();
    cluster.client().upload_bytes("f.txt", b"two nodes only").await.unwrap();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("f.txt").len() == 2).await);

    let err = cluster.client().force_replication("f.txt", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoAvailableNodes);
    assert_eq!(cluster.replicas("f.txt").len(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_raising_factor_adds_replicas() {
    let cluster = TestCluster::start(&["a", "b", "c"], 1).await.unwrap();
    cluster.client().upload_bytes("grow.txt", b"grow").await.unwrap();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("grow.txt").len() == 1).await);

    let report = cluster.client().force_replication("grow.txt", Some(3)).await.unwrap();
    assert_eq!(report.replicas, 3);
    assert_eq!(report.target_factor, 3);
    assert_eq!(report.pushed_to.len(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_new_node_picks_up_under_replicated_files() {
    let mut cluster = TestCluster::start(&["a"], 2).await.unwrap();
    cluster.client().upload_bytes("late.txt", b"waiting").await.unwrap();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("late.txt").len() == 1).await);

    cluster.add_node("b").await.unwrap();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("late.txt").len() == 2).await);
    assert_eq!(cluster.node("b").file("late.txt").unwrap(), b"waiting");
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_delete_removes_remote_copies() {
    let cluster = TestCluster::start(&["a", "b"], 2).await.unwrap();
    cluster.client().upload_bytes("tmp/x.txt", b"bye").await.unwrap();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("tmp/x.txt").len() == 2).await);

    cluster.client().delete_file("tmp/x.txt").await.unwrap();
    assert!(cluster.replicas("tmp/x.txt").is_empty());
    assert!(
        cluster
            .wait_until(WAIT, |c| c.node("a").file("tmp/x.txt").is_none()
                && c.node("b").file("tmp/x.txt").is_none())
            .await
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rename_moves_replicas() {
    let cluster = TestCluster::start(&["a", "b"], 2).await.unwrap();
    cluster.client().upload_bytes("old.txt", b"same bytes").await.unwrap();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("old.txt").len() == 2).await);

    cluster.client().rename("old.txt", "new.txt").await.unwrap();
    assert!(cluster.wait_until(WAIT, |c| c.replicas("new.txt").len() == 2).await);
    assert!(cluster.replicas("old.txt").is_empty());
    assert!(
        cluster
            .wait_until(WAIT, |c| c.node("a").file("old.txt").is_none())
            .await
    );
    assert_eq!(cluster.node("a").file("new.txt").unwrap(), b"same bytes");
    cluster.shutdown().await;
}
