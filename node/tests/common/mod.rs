//! Helpers for multi-node tests on loopback.

#![allow(dead_code)]

use std::collections::HashSet;

use bytes::Bytes;
use letslive_node::{Block, Cid, Node, NodeConfig, Role};
use letslive_storage::{BlockStore, MemoryBlockStore, Result as StoreResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// In-memory bootstrap node configuration on an ephemeral loopback port.
pub fn bootstrap_config() -> NodeConfig {
    let mut config = NodeConfig {
        role: Role::Bootstrap,
        listen_addresses: vec!["/ip4/127.0.0.1/tcp/0".to_string()],
        fetch_retries: 1,
        ..NodeConfig::default()
    };
    config.dht.rpc_timeout_secs = 5;
    config.exchange.request_timeout_secs = 5;
    config.bootstrap.max_attempts = 3;
    config.bootstrap.initial_backoff_ms = 100;
    config.bootstrap.max_backoff_ms = 500;
    config.bootstrap.dial_timeout_secs = 5;
    config
}

/// A normal node joining through `boot`.
pub fn peer_config(boot: &Node) -> NodeConfig {
    let address = boot
        .bootstrap_address()
        .expect("bootstrap node has an address");
    NodeConfig {
        role: Role::Normal,
        bootstrap_address: Some(address.to_string()),
        ..bootstrap_config()
    }
}

pub async fn spawn_bootstrap() -> Node {
    init_tracing();
    Node::start(bootstrap_config())
        .await
        .expect("bootstrap node starts")
}

pub async fn spawn_peer(boot: &Node) -> Node {
    Node::start(peer_config(boot)).await.expect("peer joins")
}

/// Reproducible pseudo-random content.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Serves selected blocks with a flipped byte, as if the disk rotted.
#[derive(Default)]
pub struct CorruptingStore {
    inner: MemoryBlockStore,
    corrupt: Mutex<HashSet<Cid>>,
}

impl CorruptingStore {
    pub fn corrupt(&self, cid: Cid) {
        self.corrupt.lock().insert(cid);
    }
}

impl BlockStore for CorruptingStore {
    fn put(&self, block: &Block) -> StoreResult<()> {
        self.inner.put(block)
    }

    fn get(&self, cid: &Cid) -> StoreResult<Bytes> {
        let data = self.inner.get(cid)?;
        if !self.corrupt.lock().contains(cid) {
            return Ok(data);
        }
        let mut bytes = data.to_vec();
        match bytes.first_mut() {
            Some(first) => *first ^= 0xff,
            None => bytes.push(0),
        }
        Ok(Bytes::from(bytes))
    }

    fn has(&self, cid: &Cid) -> StoreResult<bool> {
        self.inner.has(cid)
    }

    fn delete(&self, cid: &Cid) -> StoreResult<()> {
        self.corrupt.lock().remove(cid);
        self.inner.delete(cid)
    }

    fn len(&self) -> StoreResult<usize> {
        self.inner.len()
    }

    fn cids(&self) -> StoreResult<Vec<Cid>> {
        self.inner.cids()
    }
}
