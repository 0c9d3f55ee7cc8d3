//! Kademlia-style distributed hash table over host streams.
//!
//! Peers are located by XOR distance between BLAKE3 keys. Content is found
//! through provider records stored on the peers closest to a CID's key.

pub mod message;
pub mod providers;
pub mod query;
pub mod routing;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::io::AsyncWriteExt;
use futures::StreamExt;
use letslive_types::Cid;
use libp2p::{PeerId, Stream, StreamProtocol};
use parking_lot::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::host::{ConnectionEvent, Host, HostError, PeerInfo};
use crate::wire::{self, WireError};
use message::{DhtRequest, DhtResponse, RequestBody};
use providers::ProviderStore;
use query::{made_progress, LookupState};
pub use routing::{Distance, Key, RoutingTable, UpdateOutcome, MAX_FAILURES};

/// Stream protocol for DHT RPCs.
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/letslive/kad/1.0.0");

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),
    #[error("failed to provide {cid}: {reason}")]
    ProvideFailed { cid: Cid, reason: String },
    #[error("routing table is empty")]
    NoPeers,
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("rpc to {0} timed out")]
    Timeout(PeerId),
    #[error("unexpected response from {0}")]
    UnexpectedResponse(PeerId),
}

/// DHT parameters.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket size and replication factor.
    pub k: usize,
    /// Parallel requests per lookup round.
    pub alpha: usize,
    pub max_rounds: usize,
    pub rpc_timeout: Duration,
    pub refresh_interval: Duration,
    pub provider_ttl: Duration,
    pub republish_interval: Duration,
    pub max_providers: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            max_rounds: 10,
            rpc_timeout: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(10 * 60),
            provider_ttl: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(20 * 60),
            max_providers: 20,
        }
    }
}

/// A located peer and the number of lookup rounds it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundPeer {
    pub info: PeerInfo,
    pub rounds: usize,
}

#[derive(Debug, Clone, Copy)]
enum LookupTarget {
    Node(Key),
    Peer(PeerId),
    Providers(Cid),
}

impl LookupTarget {
    fn key(&self) -> Key {
        match self {
            LookupTarget::Node(key) => *key,
            LookupTarget::Peer(peer_id) => Key::from_peer(peer_id),
            LookupTarget::Providers(cid) => Key::from_cid(cid),
        }
    }

    fn request(&self) -> RequestBody {
        match self {
            LookupTarget::Providers(cid) => RequestBody::GetProviders { cid: *cid },
            _ => RequestBody::FindNode { key: self.key() },
        }
    }
}

#[derive(Debug, Default)]
struct LookupOutcome {
    closest: Vec<PeerInfo>,
    providers: Vec<PeerInfo>,
    found: Option<PeerInfo>,
    rounds: usize,
}

/// DHT service bound to one host.
pub struct Dht {
    host: Arc<Host>,
    config: DhtConfig,
    local_id: PeerId,
    table: RoutingTable,
    providers: ProviderStore,
    provided: RwLock<HashSet<Cid>>,
    /// Peers joined through, re-dialed when the table runs dry.
    seeds: RwLock<Vec<PeerInfo>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dht {
    pub fn new(host: Arc<Host>, config: DhtConfig) -> Arc<Self> {
        let local_id = host.peer_id();
        Arc::new(Self {
            table: RoutingTable::new(local_id, config.k),
            providers: ProviderStore::new(config.provider_ttl, config.max_providers),
            host,
            config,
            local_id,
            provided: RwLock::new(HashSet::new()),
            seeds: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register the RPC handler and spawn the background tasks: connection
    /// event consumer, RPC server, bucket refresh and provider republish.
    pub fn start(self: &Arc<Self>) -> Result<(), DhtError> {
        let incoming = self.host.accept(KAD_PROTOCOL)?;
        let mut tasks = Vec::with_capacity(4);

        match self.host.take_event_receiver() {
            Some(events) => tasks.push(tokio::spawn(self.clone().consume_events(events))),
            None => warn!("connection events already taken, table fills from rpc traffic only"),
        }
        tasks.push(tokio::spawn(self.clone().serve(incoming)));
        tasks.push(tokio::spawn(self.clone().refresh_buckets()));
        tasks.push(tokio::spawn(self.clone().republish()));

        self.tasks.lock().extend(tasks);
        info!(peer_id = %self.local_id, "dht started");
        Ok(())
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    /// Record contact with a peer. An empty address list only refreshes a
    /// peer the table already knows.
    pub fn add_peer(&self, info: PeerInfo) -> UpdateOutcome {
        self.table.update(info)
    }

    /// Join the network through `peer`: add it to the table, then look
    /// ourselves up so the peers closest to us learn about this node.
    ///
    /// `peer` is remembered and dialed again whenever the table is left
    /// without a responsive entry.
    pub async fn bootstrap(&self, peer: PeerInfo) -> Result<usize, DhtError> {
        {
            let mut seeds = self.seeds.write();
            if !seeds.iter().any(|seed| seed.peer_id == peer.peer_id) {
                seeds.push(peer.clone());
            }
        }
        self.host.dial(&peer).await?;
        self.table.update(peer);
        let outcome = self.lookup(LookupTarget::Peer(self.local_id)).await;
        let known = self.table.len();
        if known == 0 {
            return Err(DhtError::NoPeers);
        }
        info!(peers = known, rounds = outcome.rounds, "bootstrap lookup complete");
        Ok(known)
    }

    /// Locate `peer_id`, from the table when known, otherwise by iterative lookup.
    pub async fn find_peer(&self, peer_id: PeerId) -> Result<FoundPeer, DhtError> {
        if let Some(info) = self.table.get(&peer_id) {
            return Ok(FoundPeer { info, rounds: 0 });
        }
        let outcome = self.lookup(LookupTarget::Peer(peer_id)).await;
        match outcome.found {
            Some(info) => Ok(FoundPeer {
                info,
                rounds: outcome.rounds,
            }),
            None => Err(DhtError::PeerNotFound(peer_id)),
        }
    }

    /// Announce this node as a provider of `cid` and keep re-announcing it.
    /// Returns how many peers stored the record.
    pub async fn provide(&self, cid: Cid) -> Result<usize, DhtError> {
        self.provided.write().insert(cid);
        self.announce(cid).await
    }

    /// Stop re-announcing `cid`. Records already stored remotely expire.
    pub fn stop_providing(&self, cid: &Cid) -> bool {
        self.provided.write().remove(cid)
    }

    pub fn provided(&self) -> Vec<Cid> {
        self.provided.read().iter().copied().collect()
    }

    /// Providers of `cid`, closest to its key first.
    pub async fn find_providers(&self, cid: Cid) -> Result<Vec<PeerInfo>, DhtError> {
        let mut found: HashMap<PeerId, PeerInfo> = HashMap::new();
        merge_providers(&mut found, self.providers.providers(&cid));

        if found.len() < self.config.max_providers {
            let outcome = self.lookup(LookupTarget::Providers(cid)).await;
            debug!(%cid, rounds = outcome.rounds, providers = outcome.providers.len(), "provider lookup finished");
            merge_providers(&mut found, outcome.providers);
        }

        for provider in found.values_mut() {
            if provider.addrs.is_empty() {
                if let Some(known) = self.table.get(&provider.peer_id) {
                    provider.addrs = known.addrs;
                }
            }
        }

        let key = Key::from_cid(&cid);
        let mut providers: Vec<PeerInfo> = found.into_values().collect();
        providers.sort_by_key(|provider| key.distance(&Key::from_peer(&provider.peer_id)));
        providers.truncate(self.config.max_providers);
        Ok(providers)
    }

    /// Cancel background tasks and in-flight rpc handlers and wait for them
    /// to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!("dht task ended abnormally: {err}");
            }
        }
    }

    async fn announce(&self, cid: Cid) -> Result<usize, DhtError> {
        self.providers.add(cid, self.host.peer_info());

        let outcome = self.lookup(LookupTarget::Node(Key::from_cid(&cid))).await;
        if outcome.closest.is_empty() {
            return Err(DhtError::ProvideFailed {
                cid,
                reason: "no peers known".to_string(),
            });
        }

        let attempts = outcome.closest.len();
        let replies = join_all(
            outcome
                .closest
                .iter()
                .map(|peer| self.rpc(peer, RequestBody::AddProvider { cid })),
        )
        .await;
        let acks = replies
            .iter()
            .filter(|reply| matches!(reply, Ok(DhtResponse::ProviderAdded)))
            .count();
        if acks == 0 {
            return Err(DhtError::ProvideFailed {
                cid,
                reason: format!("none of {attempts} peers acknowledged"),
            });
        }
        debug!(%cid, acks, attempts, "provider record stored");
        Ok(acks)
    }

    async fn lookup(&self, target: LookupTarget) -> LookupOutcome {
        let key = target.key();
        let seeds = self.table.closest(&key, self.config.k);
        let mut state = LookupState::new(key, self.local_id, self.config.k, seeds);
        let mut outcome = LookupOutcome::default();
        let mut seen_providers: HashSet<PeerId> = HashSet::new();
        let mut final_round = false;

        while outcome.rounds < self.config.max_rounds {
            let batch = if final_round {
                state.remaining_in_closest()
            } else {
                state.next_batch(self.config.alpha)
            };
            if batch.is_empty() {
                break;
            }
            outcome.rounds += 1;
            let best_before = state.best();

            let request = target.request();
            let replies = join_all(batch.iter().map(|peer| {
                let request = request.clone();
                async move { (peer, self.rpc(peer, request).await) }
            }))
            .await;

            for (peer, reply) in replies {
                match reply {
                    Ok(DhtResponse::Nodes { closer }) => {
                        state.succeeded(&peer.peer_id);
                        for info in closer {
                            state.insert(info);
                        }
                    }
                    Ok(DhtResponse::Providers { providers, closer }) => {
                        state.succeeded(&peer.peer_id);
                        for provider in providers {
                            if seen_providers.insert(provider.peer_id) {
                                outcome.providers.push(provider);
                            }
                        }
                        for info in closer {
                            state.insert(info);
                        }
                    }
                    Ok(other) => {
                        debug!(peer_id = %peer.peer_id, ?other, "unexpected lookup response");
                        state.failed(&peer.peer_id);
                    }
                    Err(err) => {
                        debug!(peer_id = %peer.peer_id, "lookup rpc failed: {err}");
                        state.failed(&peer.peer_id);
                    }
                }
            }

            if let LookupTarget::Peer(peer_id) = target {
                if peer_id != self.local_id {
                    if let Some(info) = state.get(&peer_id) {
                        outcome.found = Some(info.clone());
                        break;
                    }
                }
            }
            if matches!(target, LookupTarget::Providers(_))
                && outcome.providers.len() >= self.config.max_providers
            {
                break;
            }
            if final_round {
                break;
            }
            if !made_progress(best_before, state.best()) {
                final_round = true;
            }
        }

        outcome.closest = state.closest();
        outcome
    }

    async fn rpc(&self, peer: &PeerInfo, body: RequestBody) -> Result<DhtResponse, DhtError> {
        let name = body.name();
        let request = DhtRequest {
            sender: self.host.peer_info(),
            body,
        };
        let exchange = async {
            self.host.dial(peer).await?;
            let mut stream = self.host.open_stream(peer.peer_id, KAD_PROTOCOL).await?;
            let response: DhtResponse = wire::request(&mut stream, &request).await?;
            Ok::<_, DhtError>(response)
        };

        let result = match tokio::time::timeout(self.config.rpc_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DhtError::Timeout(peer.peer_id)),
        };
        match &result {
            Ok(_) => {
                self.table.update(peer.clone());
            }
            Err(err) => {
                debug!(peer_id = %peer.peer_id, rpc = name, "rpc failed: {err}");
                if self.table.record_failure(&peer.peer_id) {
                    debug!(peer_id = %peer.peer_id, "dropped peer after {MAX_FAILURES} failed rpcs");
                }
            }
        }
        result
    }

    async fn consume_events(
        self: Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(ConnectionEvent::Identified { peer_id, listen_addrs }) => {
                        let outcome = self.table.update(PeerInfo::new(peer_id, listen_addrs));
                        debug!(%peer_id, ?outcome, "identified peer");
                    }
                    Some(ConnectionEvent::Disconnected { peer_id }) => {
                        debug!(%peer_id, "peer disconnected");
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    }

    async fn serve(self: Arc<Self>, mut incoming: libp2p_stream::IncomingStreams) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = handlers.join_next() => {
                    if let Err(err) = joined {
                        warn!("dht rpc handler ended abnormally: {err}");
                    }
                }
                next = incoming.next() => match next {
                    Some((peer_id, stream)) => {
                        let dht = self.clone();
                        handlers.spawn(async move {
                            if let Err(err) = dht.handle_inbound(peer_id, stream).await {
                                debug!(%peer_id, "inbound dht rpc failed: {err}");
                            }
                        });
                    }
                    None => break,
                },
            }
        }
        handlers.shutdown().await;
    }

    async fn handle_inbound(&self, remote: PeerId, mut stream: Stream) -> Result<(), DhtError> {
        let request: DhtRequest =
            match tokio::time::timeout(self.config.rpc_timeout, wire::read_message(&mut stream))
                .await
            {
                Ok(request) => request?,
                Err(_) => return Err(DhtError::Timeout(remote)),
            };

        // The payload is only trusted for the peer that authenticated the connection.
        let sender = if request.sender.peer_id == remote {
            request.sender
        } else {
            warn!(%remote, claimed = %request.sender.peer_id, "sender mismatch in dht request");
            PeerInfo::new(remote, Vec::new())
        };
        self.table.update(sender.clone());

        let response = match request.body {
            RequestBody::FindNode { key } => DhtResponse::Nodes {
                closer: self.closest_excluding(&key, &remote),
            },
            RequestBody::GetProviders { cid } => {
                let mut providers = self.providers.providers(&cid);
                providers.truncate(self.config.max_providers);
                DhtResponse::Providers {
                    providers,
                    closer: self.closest_excluding(&Key::from_cid(&cid), &remote),
                }
            }
            RequestBody::AddProvider { cid } => {
                let addrs = if sender.addrs.is_empty() {
                    self.table
                        .get(&remote)
                        .map(|info| info.addrs)
                        .unwrap_or_default()
                } else {
                    sender.addrs
                };
                if self.providers.add(cid, PeerInfo::new(remote, addrs)) {
                    debug!(%cid, provider = %remote, "stored provider record");
                }
                DhtResponse::ProviderAdded
            }
            RequestBody::Ping => DhtResponse::Pong,
        };

        wire::write_message(&mut stream, &response).await?;
        stream.close().await.map_err(WireError::from)?;
        Ok(())
    }

    fn closest_excluding(&self, key: &Key, exclude: &PeerId) -> Vec<PeerInfo> {
        let mut closer = self.table.closest(key, self.config.k + 1);
        closer.retain(|info| info.peer_id != *exclude);
        closer.truncate(self.config.k);
        closer
    }

    async fn refresh_buckets(self: Arc<Self>) {
        let period = self.config.refresh_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.refresh(period) => {}
                    }
                }
            }
        }
    }

    async fn refresh(&self, max_age: Duration) {
        if self.table.responsive_len() == 0 {
            self.rejoin().await;
        }

        let stale = self.table.stale_buckets(max_age);
        if !stale.is_empty() {
            debug!(buckets = stale.len(), "refreshing stale buckets");
        }
        for index in stale {
            let key = self.table.random_key_in_bucket(index);
            let outcome = self.lookup(LookupTarget::Node(key)).await;
            debug!(index, rounds = outcome.rounds, "bucket refreshed");
        }
    }

    /// Run bootstrap again through each remembered seed until one succeeds.
    async fn rejoin(&self) {
        let seeds = self.seeds.read().clone();
        if seeds.is_empty() {
            return;
        }
        warn!(seeds = seeds.len(), "no responsive peers left, re-dialing bootstrap peers");
        for seed in seeds {
            match self.bootstrap(seed.clone()).await {
                Ok(known) => {
                    info!(peer_id = %seed.peer_id, peers = known, "rejoined the network");
                    return;
                }
                Err(err) => warn!(peer_id = %seed.peer_id, "rejoin failed: {err}"),
            }
        }
    }

    async fn republish(self: Arc<Self>) {
        let period = self.config.republish_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.republish_all() => {}
                    }
                }
            }
        }
    }

    async fn republish_all(&self) {
        let expired = self.providers.remove_expired();
        if expired > 0 {
            debug!(expired, "dropped expired provider records");
        }
        for cid in self.provided() {
            if let Err(err) = self.announce(cid).await {
                warn!(%cid, "republish failed: {err}");
            }
        }
    }
}

fn merge_providers(found: &mut HashMap<PeerId, PeerInfo>, providers: Vec<PeerInfo>) {
    for provider in providers {
        let entry = found
            .entry(provider.peer_id)
            .or_insert_with(|| PeerInfo::new(provider.peer_id, Vec::new()));
        for addr in provider.addrs {
            if !entry.addrs.contains(&addr) {
                entry.addrs.push(addr);
            }
        }
    }
}
