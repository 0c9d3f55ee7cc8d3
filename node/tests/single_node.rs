mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{bootstrap_config, init_tracing, random_bytes, CorruptingStore};
use letslive_node::{Cid, Codec, Node, NodeBuilder, NodeConfig, NodeError, Role};
use letslive_storage::BlockStore;
use tempfile::TempDir;

async fn small_chunk_node() -> Node {
    init_tracing();
    let mut config = bootstrap_config();
    config.dag.chunk_size = 1024;
    config.dag.max_fanout = 4;
    config.provide_on_add = false;
    config.fetch_retries = 0;
    Node::start(config).await.expect("node starts")
}

#[tokio::test]
async fn round_trips_files_of_every_shape() {
    let node = small_chunk_node().await;

    let cases: Vec<(&str, Vec<u8>, usize)> = vec![
        ("empty", Vec::new(), 1),
        ("single byte", vec![0x42], 1),
        ("exact chunk", random_bytes(1024, 1), 1),
        ("two leaves", random_bytes(1025, 2), 3),
        // 10 leaves, 3 link nodes, 1 root
        ("multi-level", random_bytes(10 * 1024, 3), 14),
    ];

    for (name, data, expected_blocks) in cases {
        let encoded = node.add_file(&data[..]).await.expect(name);
        assert_eq!(encoded.size, data.len() as u64, "{name}");
        assert_eq!(encoded.blocks.len(), expected_blocks, "{name}");
        assert_eq!(encoded.blocks.last(), Some(&encoded.root), "{name}");

        let back = node.get_file(encoded.root).read_to_end().await.expect(name);
        assert_eq!(back.as_ref(), &data[..], "{name}");
    }

    node.shutdown().await;
}

#[tokio::test]
async fn equal_content_yields_equal_roots() {
    let a = small_chunk_node().await;
    let b = small_chunk_node().await;
    let data = random_bytes(7_777, 9);

    let first = a.add_file(&data[..]).await.unwrap();
    let again = a.add_file(&data[..]).await.unwrap();
    let elsewhere = b.add_file(&data[..]).await.unwrap();
    assert_eq!(first.root, again.root);
    assert_eq!(first.root, elsewhere.root);
    assert_eq!(first.blocks, elsewhere.blocks);

    let mut changed = data.clone();
    changed[5_000] ^= 1;
    let other = a.add_file(&changed[..]).await.unwrap();
    assert_ne!(other.root, first.root);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn default_layout_splits_into_quarter_mebibyte_leaves() {
    init_tracing();
    let mut config = bootstrap_config();
    config.provide_on_add = false;
    let node = Node::start(config).await.unwrap();

    let data = random_bytes(3 * 512 * 1024, 4);
    let encoded = node.add_file(&data[..]).await.unwrap();
    assert_eq!(encoded.blocks.len(), 7);
    assert_eq!(node.store().len().unwrap(), 7);
    assert_eq!(encoded.root.codec(), Codec::DagNode);

    let chunks: Vec<Bytes> = {
        use futures::TryStreamExt;
        node.get_file(encoded.root).try_collect().await.unwrap()
    };
    assert_eq!(chunks.len(), 6);
    assert!(chunks.iter().all(|chunk| chunk.len() == 256 * 1024));

    node.shutdown().await;
}

#[tokio::test]
async fn unknown_root_is_unavailable() {
    let node = small_chunk_node().await;
    let missing = Cid::new(Codec::Raw, b"never added");

    let err = node.get_file(missing).read_to_end().await.unwrap_err();
    assert!(
        matches!(err, NodeError::ContentUnavailable(cid) if cid == missing),
        "unexpected error: {err}"
    );

    node.shutdown().await;
}

#[tokio::test]
async fn corrupted_local_block_fails_retrieval() {
    init_tracing();
    let store = Arc::new(CorruptingStore::default());
    let mut config = bootstrap_config();
    config.dag.chunk_size = 1024;
    config.provide_on_add = false;
    config.fetch_retries = 0;
    let node = NodeBuilder::new(config)
        .store(store.clone())
        .start()
        .await
        .unwrap();

    let data = random_bytes(4 * 1024, 5);
    let encoded = node.add_file(&data[..]).await.unwrap();
    let leaf = encoded.blocks[2];
    store.corrupt(leaf);

    let err = node.get_file(encoded.root).read_to_end().await.unwrap_err();
    assert!(
        matches!(err, NodeError::ContentUnavailable(cid) if cid == leaf),
        "unexpected error: {err}"
    );
    assert!(!store.has(&leaf).unwrap(), "corrupt copy must be discarded");

    node.shutdown().await;
}

#[tokio::test]
async fn blocks_and_identity_survive_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = bootstrap_config();
    config.data_dir = Some(dir.path().to_path_buf());
    config.dag.chunk_size = 1024;
    config.provide_on_add = false;

    let data = random_bytes(5_000, 6);
    let (root, peer_id) = {
        let node = Node::start(config.clone()).await.unwrap();
        let encoded = node.add_file(&data[..]).await.unwrap();
        let peer_id = node.peer_id();
        node.shutdown().await;
        (encoded.root, peer_id)
    };

    let node = Node::start(config).await.unwrap();
    assert_eq!(node.peer_id(), peer_id);
    let back = node.get_file(root).read_to_end().await.unwrap();
    assert_eq!(back.as_ref(), &data[..]);
    node.shutdown().await;
}

#[tokio::test]
async fn normal_node_without_bootstrap_address_is_rejected() {
    init_tracing();
    let config = NodeConfig {
        role: Role::Normal,
        bootstrap_address: None,
        ..bootstrap_config()
    };
    let err = Node::start(config).await.err().expect("start must fail");
    assert!(matches!(err, NodeError::Configuration(_)), "{err}");

    let config = NodeConfig {
        role: Role::Normal,
        bootstrap_address: Some("/ip4/127.0.0.1/tcp/4001".to_string()),
        ..bootstrap_config()
    };
    let err = Node::start(config).await.err().expect("start must fail");
    assert!(matches!(err, NodeError::Configuration(_)), "{err}");
}

#[tokio::test]
async fn unreachable_bootstrap_node_is_fatal() {
    init_tracing();
    let absent = letslive_p2p::Keypair::generate_ed25519()
        .public()
        .to_peer_id();
    let mut config = NodeConfig {
        role: Role::Normal,
        bootstrap_address: Some(format!("/ip4/127.0.0.1/tcp/1/p2p/{absent}")),
        ..bootstrap_config()
    };
    config.bootstrap.max_attempts = 2;
    config.bootstrap.initial_backoff_ms = 50;
    config.bootstrap.dial_timeout_secs = 2;

    let err = Node::start(config).await.err().expect("start must fail");
    assert!(
        matches!(err, NodeError::BootstrapFailed { attempts: 2, .. }),
        "unexpected error: {err}"
    );
}
