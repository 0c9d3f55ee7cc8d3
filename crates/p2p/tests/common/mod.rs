//! Multi-node harness shared by the p2p integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use letslive_p2p::{Dht, DhtConfig, Host, HostConfig, Keypair, Multiaddr, PeerInfo};
use tracing::info;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn loopback() -> Multiaddr {
    "/ip4/127.0.0.1/tcp/0".parse().unwrap()
}

pub fn fast_dht_config() -> DhtConfig {
    DhtConfig {
        rpc_timeout: Duration::from_secs(5),
        ..DhtConfig::default()
    }
}

/// A host listening on loopback.
pub async fn spawn_host() -> Arc<Host> {
    spawn_host_at(None, loopback()).await
}

/// A host with a fixed identity listening on `address`.
pub async fn spawn_host_at(keypair: Option<Keypair>, address: Multiaddr) -> Arc<Host> {
    let host = Arc::new(
        Host::new(HostConfig {
            keypair,
            dial_timeout: Duration::from_secs(5),
            ..HostConfig::default()
        })
        .expect("host starts"),
    );
    host.listen(address).await.expect("listen");
    host
}

/// A host with a running DHT.
pub struct TestPeer {
    pub name: String,
    pub host: Arc<Host>,
    pub dht: Arc<Dht>,
}

impl TestPeer {
    pub async fn spawn(name: &str, config: DhtConfig) -> Self {
        Self::with_host(name, spawn_host().await, config)
    }

    pub fn with_host(name: &str, host: Arc<Host>, config: DhtConfig) -> Self {
        let dht = Dht::new(host.clone(), config);
        dht.start().expect("dht starts");
        info!("[{name}] spawned {} at {:?}", host.peer_id(), host.listen_addrs());
        Self {
            name: name.to_string(),
            host,
            dht,
        }
    }

    pub fn info(&self) -> PeerInfo {
        self.host.peer_info()
    }

    pub async fn shutdown(&self) {
        self.dht.shutdown().await;
        self.host.shutdown().await;
    }
}

/// A bootstrap peer followed by `count` peers that joined through it.
pub async fn spawn_network(count: usize, config: DhtConfig) -> (TestPeer, Vec<TestPeer>) {
    let boot = TestPeer::spawn("boot", config.clone()).await;
    let mut peers = Vec::with_capacity(count);
    for i in 0..count {
        let peer = TestPeer::spawn(&format!("node-{i}"), config.clone()).await;
        peer.dht
            .bootstrap(boot.info())
            .await
            .expect("bootstrap succeeds");
        peers.push(peer);
    }
    (boot, peers)
}
