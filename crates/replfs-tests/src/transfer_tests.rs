//! Chunked transfers and version history through the wire protocol.

use replfs_server::{ChunkStatus, ErrorKind};
use replfs_transport::{split_into_chunks, FileChunk};

use crate::harness::TestCluster;

#[tokio::test]
async fn test_download_matches_upload() {
    let cluster = TestCluster::start(&[], 1).await.unwrap();
    let data: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let summary = cluster.client().upload_bytes("/x/y.bin", &data).await.unwrap();
    assert_eq!(summary.path, "x/y.bin");
    assert_eq!(summary.chunks, 5);
    assert_eq!(cluster.client().download("x/y.bin").await.unwrap(), data);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_mutated_chunk_never_written() {
    let cluster = TestCluster::start(&[], 1).await.unwrap();
    let mut chunk = FileChunk::new("t", "corrupt.bin", 0, 1, vec![1, 2, 3]);
    chunk.data[1] = 9;
    let ack = cluster.client().send_chunk(&chunk).await.unwrap();
    assert_eq!(ack.status, ChunkStatus::ChecksumMismatch);
    assert!(!cluster.server_root().join("corrupt.bin").exists());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_gap_in_chunk_stream_not_finalized() {
    let cluster = TestCluster::start(&[], 1).await.unwrap();
    let chunks = split_into_chunks("gap", "gap.bin", &[7u8; 30], 10);
    assert_eq!(cluster.client().send_chunk(&chunks[0]).await.unwrap().status, ChunkStatus::Received);
    assert_eq!(cluster.client().send_chunk(&chunks[2]).await.unwrap().status, ChunkStatus::Failed);
    assert!(!cluster.server_root().join("gap.bin").exists());

    assert_eq!(cluster.client().send_chunk(&chunks[0]).await.unwrap().status, ChunkStatus::Duplicate);
    assert_eq!(cluster.client().send_chunk(&chunks[1]).await.unwrap().status, ChunkStatus::Received);
    assert_eq!(cluster.client().send_chunk(&chunks[2]).await.unwrap().status, ChunkStatus::Completed);
    assert_eq!(std::fs::read(cluster.server_root().join("gap.bin")).unwrap(), vec![7u8; 30]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_version_retention_and_restore() {
    let cluster = TestCluster::start(&[], 1).await.unwrap();
    let client = cluster.client();
    client.upload_bytes("v.txt", b"original").await.unwrap();
    let first = client.create_version("v.txt", "tester", "first").await.unwrap();
    for i in 0..14 {
        client.upload_bytes("v.txt", format!("edit {}", i).as_bytes()).await.unwrap();
        client.create_version("v.txt", "tester", "").await.unwrap();
    }
    let versions = client.list_versions("v.txt").await.unwrap();
    assert_eq!(versions.len(), 10);
    assert!(versions.iter().all(|v| v.version_id != first.version_id));

    let err = client.restore_version("v.txt", &first.version_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let newest = versions[0].clone();
    client.upload_bytes("v.txt", b"scratch").await.unwrap();
    let (_, backup) = client.restore_version("v.txt", &newest.version_id).await.unwrap();
    assert!(backup.is_some());
    assert_eq!(client.download("v.txt").await.unwrap(), b"edit 13");
    cluster.shutdown().await;
}
