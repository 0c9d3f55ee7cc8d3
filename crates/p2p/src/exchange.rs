//! Block exchange: fetch a block by CID from candidate peers, and serve
//! blocks from the local store.

use std::sync::Arc;
use std::time::Duration;

use futures::io::AsyncWriteExt;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use letslive_storage::{BlockStore, StoreError};
use letslive_types::{Block, Cid};
use libp2p::{PeerId, Stream, StreamProtocol};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dht::Dht;
use crate::host::{Host, HostError, PeerInfo};
use crate::wire::{self, WireError, MAX_FRAME_LEN};

/// Stream protocol for block requests.
pub const BLOCKS_PROTOCOL: StreamProtocol = StreamProtocol::new("/letslive/blocks/1.0.0");

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("block {cid} unavailable after {attempts} attempts")]
    BlockUnavailable { cid: Cid, attempts: usize },
    #[error("peer {peer} does not have {cid}")]
    NotFound { peer: PeerId, cid: Cid },
    #[error("peer {peer} sent bytes that do not hash to {cid}")]
    HashMismatch { peer: PeerId, cid: Cid },
    #[error("request to {0} timed out")]
    Timeout(PeerId),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub cid: Cid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockResponse {
    Block(Vec<u8>),
    NotFound,
}

/// Bytes bincode adds around a block payload: variant tag and length prefix.
pub const BLOCK_RESPONSE_OVERHEAD: usize = 4 + 8;

/// Largest block that fits in one response frame.
pub const MAX_BLOCK_LEN: usize = MAX_FRAME_LEN - BLOCK_RESPONSE_OVERHEAD;

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Deadline for one request to one peer, dial included.
    pub request_timeout: Duration,
    /// Candidates queried at the same time.
    pub max_in_flight: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_in_flight: 3,
        }
    }
}

pub struct BlockExchange {
    host: Arc<Host>,
    store: Arc<dyn BlockStore>,
    /// Told about every peer a block request succeeds with, in either direction.
    routing: Option<Arc<Dht>>,
    config: ExchangeConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockExchange {
    pub fn new(
        host: Arc<Host>,
        store: Arc<dyn BlockStore>,
        routing: Option<Arc<Dht>>,
        config: ExchangeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            store,
            routing,
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register the block protocol and start answering requests.
    pub fn start(self: &Arc<Self>) -> Result<(), ExchangeError> {
        let incoming = self.host.accept(BLOCKS_PROTOCOL)?;
        let task = tokio::spawn(self.clone().serve(incoming));
        self.tasks.lock().push(task);
        info!("block exchange serving {}", BLOCKS_PROTOCOL);
        Ok(())
    }

    /// Fetch `cid` from `candidates`.
    ///
    /// Up to `max_in_flight` peers are asked at once. The first response that
    /// hashes to `cid` wins and the remaining requests are dropped. Failures
    /// move on to the next candidate.
    pub async fn fetch(&self, cid: Cid, candidates: Vec<PeerInfo>) -> Result<Block, ExchangeError> {
        let local = self.host.peer_id();
        let mut queue = candidates
            .into_iter()
            .filter(|candidate| candidate.peer_id != local);
        let mut in_flight = FuturesUnordered::new();
        let mut attempts = 0;

        loop {
            while in_flight.len() < self.config.max_in_flight.max(1) {
                let Some(peer) = queue.next() else { break };
                attempts += 1;
                in_flight.push(async move {
                    let result = self.fetch_from(&peer, cid).await;
                    (peer, result)
                });
            }

            match in_flight.next().await {
                Some((peer, Ok(block))) => {
                    debug!(%cid, peer_id = %peer.peer_id, attempts, "fetched block");
                    self.observe(peer);
                    return Ok(block);
                }
                Some((PeerInfo { peer_id, .. }, Err(err))) => match err {
                    ExchangeError::HashMismatch { .. } => {
                        warn!(%cid, %peer_id, "discarding corrupt block")
                    }
                    err => debug!(%cid, %peer_id, "fetch attempt failed: {err}"),
                },
                None => return Err(ExchangeError::BlockUnavailable { cid, attempts }),
            }
        }
    }

    /// One request to one peer, bounded by `request_timeout`.
    pub async fn fetch_from(&self, peer: &PeerInfo, cid: Cid) -> Result<Block, ExchangeError> {
        let exchange = async {
            self.host.dial(peer).await?;
            let mut stream = self.host.open_stream(peer.peer_id, BLOCKS_PROTOCOL).await?;
            let response: BlockResponse = wire::request(&mut stream, &BlockRequest { cid }).await?;
            Ok::<_, ExchangeError>(response)
        };

        let response = tokio::time::timeout(self.config.request_timeout, exchange)
            .await
            .map_err(|_| ExchangeError::Timeout(peer.peer_id))??;
        match response {
            BlockResponse::Block(data) => {
                let block = Block::from_parts(cid, data);
                if block.verify() {
                    Ok(block)
                } else {
                    Err(ExchangeError::HashMismatch {
                        peer: peer.peer_id,
                        cid,
                    })
                }
            }
            BlockResponse::NotFound => Err(ExchangeError::NotFound {
                peer: peer.peer_id,
                cid,
            }),
        }
    }

    fn observe(&self, peer: PeerInfo) {
        if let Some(dht) = &self.routing {
            dht.add_peer(peer);
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!("exchange task ended abnormally: {err}");
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
                        warn!("block request handler ended abnormally: {err}");
                    }
                }
                next = incoming.next() => match next {
                    Some((peer_id, stream)) => {
                        let exchange = self.clone();
                        handlers.spawn(async move {
                            if let Err(err) = exchange.answer(peer_id, stream).await {
                                debug!(%peer_id, "block request failed: {err}");
                            }
                        });
                    }
                    None => break,
                },
            }
        }
        handlers.shutdown().await;
    }

    /// Answer one request from the local store. Never proxies.
    async fn answer(&self, peer_id: PeerId, mut stream: Stream) -> Result<(), ExchangeError> {
        let request: BlockRequest =
            tokio::time::timeout(self.config.request_timeout, wire::read_message(&mut stream))
                .await
                .map_err(|_| ExchangeError::Timeout(peer_id))??;

        let response = match self.store.get(&request.cid) {
            Ok(data) if data.len() > MAX_BLOCK_LEN => {
                warn!(cid = %request.cid, len = data.len(), "block exceeds the response frame limit");
                BlockResponse::NotFound
            }
            Ok(data) => BlockResponse::Block(data.to_vec()),
            Err(StoreError::NotFound(_)) => BlockResponse::NotFound,
            Err(err) => {
                warn!(cid = %request.cid, "store read failed while serving: {err}");
                BlockResponse::NotFound
            }
        };
        debug!(cid = %request.cid, %peer_id, found = matches!(response, BlockResponse::Block(_)), "serving block request");

        wire::write_message(&mut stream, &response).await?;
        stream.close().await.map_err(WireError::from)?;
        self.observe(PeerInfo::new(peer_id, Vec::new()));
        Ok(())
    }
}
