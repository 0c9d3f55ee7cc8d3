//! DHT behaviour across real hosts on loopback.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    fast_dht_config, init_tracing, loopback, spawn_host, spawn_host_at, spawn_network, TestPeer,
};
use futures::io::AsyncWriteExt;
use futures::StreamExt;
use letslive_p2p::dht::message::{DhtRequest, DhtResponse, RequestBody};
use letslive_p2p::dht::MAX_FAILURES;
use letslive_p2p::{wire, DhtConfig, DhtError, Host, Keypair, PeerInfo, KAD_PROTOCOL};
use letslive_types::{Cid, Codec};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routing_converges_across_twenty_nodes() {
    init_tracing();
    let (boot, peers) = spawn_network(20, fast_dht_config()).await;

    // ceil(log2(20))
    let max_rounds = 5;
    for searcher in &peers {
        for target in peers.iter().chain(std::iter::once(&boot)) {
            if target.host.peer_id() == searcher.host.peer_id() {
                continue;
            }
            let found = searcher
                .dht
                .find_peer(target.host.peer_id())
                .await
                .unwrap_or_else(|err| panic!("[{}] lookup of {} failed: {err}", searcher.name, target.name));
            assert_eq!(found.info.peer_id, target.host.peer_id());
            assert!(
                found.rounds <= max_rounds,
                "[{}] needed {} rounds to find {}",
                searcher.name,
                found.rounds,
                target.name
            );
        }
    }

    for peer in peers.iter().chain(std::iter::once(&boot)) {
        peer.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn provider_records_are_discoverable() {
    init_tracing();
    let (boot, peers) = spawn_network(3, fast_dht_config()).await;
    let cid = Cid::new(Codec::Raw, b"segment-0042.ts");

    let acks = peers[0].dht.provide(cid).await.expect("provide succeeds");
    assert!(acks >= 1);
    assert_eq!(peers[0].dht.provided(), vec![cid]);

    let providers = peers[2].dht.find_providers(cid).await.unwrap();
    assert!(providers
        .iter()
        .any(|provider| provider.peer_id == peers[0].host.peer_id()));
    assert!(providers.iter().all(|provider| !provider.addrs.is_empty()));

    let unknown = Cid::new(Codec::Raw, b"never provided");
    assert!(peers[1].dht.find_providers(unknown).await.unwrap().is_empty());

    for peer in peers.iter().chain(std::iter::once(&boot)) {
        peer.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provide_without_peers_fails() {
    init_tracing();
    let lonely = TestPeer::spawn("lonely", fast_dht_config()).await;
    let cid = Cid::new(Codec::Raw, b"orphan");
    assert!(matches!(
        lonely.dht.provide(cid).await,
        Err(DhtError::ProvideFailed { .. })
    ));
    // still scheduled for republish once peers show up
    assert_eq!(lonely.dht.provided(), vec![cid]);
    lonely.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_is_the_authenticated_remote() {
    init_tracing();
    let server = TestPeer::spawn("server", fast_dht_config()).await;
    let client = spawn_host().await;
    let forged = Keypair::generate_ed25519().public().to_peer_id();
    let cid = Cid::new(Codec::DagNode, b"playlist");

    client.dial(&server.info()).await.unwrap();
    let mut stream = client
        .open_stream(server.host.peer_id(), KAD_PROTOCOL)
        .await
        .unwrap();
    let request = DhtRequest {
        sender: PeerInfo::new(forged, client.listen_addrs()),
        body: RequestBody::AddProvider { cid },
    };
    let response: DhtResponse = wire::request(&mut stream, &request).await.unwrap();
    assert!(matches!(response, DhtResponse::ProviderAdded));
    let _ = stream.close().await;

    let providers = server.dht.find_providers(cid).await.unwrap();
    let ids: Vec<_> = providers.iter().map(|p| p.peer_id).collect();
    assert_eq!(ids, vec![client.peer_id()]);
    assert!(!server.dht.routing_table().contains(&forged));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeatedly_failing_peer_is_evicted() {
    init_tracing();
    let node = TestPeer::spawn("node", fast_dht_config()).await;
    let ghost = PeerInfo::new(
        Keypair::generate_ed25519().public().to_peer_id(),
        vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
    );
    node.dht.add_peer(ghost.clone());
    assert!(node.dht.routing_table().contains(&ghost.peer_id));

    for attempt in 1..=MAX_FAILURES {
        let missing = Keypair::generate_ed25519().public().to_peer_id();
        let result = tokio::time::timeout(Duration::from_secs(20), node.dht.find_peer(missing))
            .await
            .unwrap();
        assert!(matches!(result, Err(DhtError::PeerNotFound(_))));
        assert_eq!(
            node.dht.routing_table().contains(&ghost.peer_id),
            attempt < MAX_FAILURES,
            "after {attempt} failures"
        );
    }
    assert_eq!(node.dht.routing_table().responsive_len(), 0);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_populates_both_tables() {
    init_tracing();
    let (boot, peers) = spawn_network(2, fast_dht_config()).await;

    let first = peers[0].host.peer_id();
    let second = peers[1].host.peer_id();
    assert!(boot.dht.routing_table().contains(&first));
    assert!(boot.dht.routing_table().contains(&second));
    // the second joiner's self-lookup reached the first
    assert!(peers[1].dht.routing_table().contains(&first));

    for peer in peers.iter().chain(std::iter::once(&boot)) {
        peer.shutdown().await;
    }
}

/// Accepts DHT streams and never answers them.
async fn spawn_silent_peer() -> (Arc<Host>, tokio::task::JoinHandle<()>) {
    let host = spawn_host().await;
    let mut incoming = host.accept(KAD_PROTOCOL).unwrap();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some((_, stream)) = incoming.next().await {
            held.push(stream);
        }
    });
    (host, holder)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_interrupts_background_rpcs() {
    init_tracing();
    let (silent, holder) = spawn_silent_peer().await;
    let config = DhtConfig {
        rpc_timeout: Duration::from_secs(8),
        refresh_interval: Duration::from_millis(500),
        republish_interval: Duration::from_millis(500),
        ..DhtConfig::default()
    };
    let node = TestPeer::spawn("node", config).await;
    node.dht.add_peer(silent.peer_info());

    // each provide blocks on the silent peer but joins the republish set at once
    let provides: Vec<_> = (0..3u8)
        .map(|i| {
            let dht = node.dht.clone();
            tokio::spawn(async move { dht.provide(Cid::new(Codec::Raw, &[i])).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(node.dht.provided().len(), 3);

    let started = Instant::now();
    node.dht.shutdown().await;
    let took = started.elapsed();
    assert!(took < Duration::from_secs(2), "shutdown took {took:?}");

    for provide in provides {
        provide.abort();
    }
    holder.abort();
    node.host.shutdown().await;
    silent.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejoins_after_bootstrap_outage() {
    init_tracing();
    let config = DhtConfig {
        rpc_timeout: Duration::from_secs(2),
        refresh_interval: Duration::from_millis(300),
        ..DhtConfig::default()
    };
    let boot_key = Keypair::generate_ed25519();
    let boot_host = spawn_host_at(Some(boot_key.clone()), loopback()).await;
    let boot_addr = boot_host.listen_addrs()[0].clone();
    let boot = TestPeer::with_host("boot", boot_host, config.clone());
    let boot_info = boot.info();

    let node = TestPeer::spawn("node", config.clone()).await;
    node.dht.bootstrap(boot_info.clone()).await.unwrap();
    assert!(node.dht.routing_table().contains(&boot_info.peer_id));

    boot.shutdown().await;
    drop(boot);

    let missing = Keypair::generate_ed25519().public().to_peer_id();
    assert!(node.dht.find_peer(missing).await.is_err());
    assert_eq!(node.dht.routing_table().responsive_len(), 0);

    // same identity, same port
    let boot = TestPeer::with_host(
        "boot",
        spawn_host_at(Some(boot_key), boot_addr).await,
        config,
    );

    let deadline = Instant::now() + Duration::from_secs(15);
    while node.dht.routing_table().responsive_len() == 0 {
        assert!(Instant::now() < deadline, "node never rejoined");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(node.dht.routing_table().contains(&boot_info.peer_id));
    assert!(boot.dht.routing_table().contains(&node.host.peer_id()));

    node.shutdown().await;
    boot.shutdown().await;
}
