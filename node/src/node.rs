//! Node facade: one Host, its DHT and block exchange, a block store and the
//! DAG codec, composed behind add/get operations.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use letslive_dag::{BlockFetcher, DagBuilder, DagReader, EncodedFile};
use letslive_p2p::{
    BlockExchange, Dht, Host, HostConfig, Keypair, Multiaddr, PeerId, PeerInfo,
};
use letslive_storage::{BlockStore, MemoryBlockStore, SledBlockStore, StoreError};
use letslive_types::Cid;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::{self, Backoff};
use crate::config::{NodeConfig, Role};
use crate::error::{NodeError, Result};

/// Blocks announced at the same time after an add.
const PROVIDE_CONCURRENCY: usize = 8;

const FETCH_BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const FETCH_BACKOFF_MAX: Duration = Duration::from_secs(4);

/// Sub-directory of `data_dir` holding the sled database.
const BLOCKS_DIR: &str = "blocks";

/// Assembles a [`Node`], optionally with a caller-supplied store or key.
pub struct NodeBuilder {
    config: NodeConfig,
    store: Option<Arc<dyn BlockStore>>,
    keypair: Option<Keypair>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            store: None,
            keypair: None,
        }
    }

    /// Use `store` instead of the one `data_dir` selects.
    pub fn store(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `keypair` instead of the configured identity.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Start networking, then join according to the configured role.
    pub async fn start(self) -> Result<Node> {
        let config = self.config;
        config.validate()?;

        let dag = DagBuilder::new(config.dag)?;
        let listen = config.listen_multiaddrs()?;
        let bootstrap_peer = match config.role {
            Role::Normal => Some(config.bootstrap_peer()?),
            Role::Bootstrap => None,
        };

        let store: Arc<dyn BlockStore> = match (self.store, &config.data_dir) {
            (Some(store), _) => store,
            (None, Some(data_dir)) => Arc::new(SledBlockStore::new(data_dir.join(BLOCKS_DIR))?),
            (None, None) => Arc::new(MemoryBlockStore::new()),
        };
        let keypair = match self.keypair {
            Some(keypair) => Some(keypair),
            None => config.load_identity()?,
        };

        let host = Arc::new(Host::new(HostConfig {
            keypair,
            dial_timeout: config.bootstrap.dial_timeout(),
            ..HostConfig::default()
        })?);
        let dht = Dht::new(host.clone(), config.dht.to_dht_config());
        let exchange = BlockExchange::new(
            host.clone(),
            store.clone(),
            Some(dht.clone()),
            config.exchange.to_exchange_config(),
        );

        let node = Node {
            config,
            host,
            dht,
            exchange,
            store,
            dag,
            cancel: CancellationToken::new(),
        };

        if let Err(err) = node.launch(listen, bootstrap_peer).await {
            node.shutdown().await;
            return Err(err);
        }
        Ok(node)
    }
}

/// A running storage node.
pub struct Node {
    config: NodeConfig,
    host: Arc<Host>,
    dht: Arc<Dht>,
    exchange: Arc<BlockExchange>,
    store: Arc<dyn BlockStore>,
    dag: DagBuilder,
    cancel: CancellationToken,
}

impl Node {
    /// Start a node with the store and identity its configuration selects.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        NodeBuilder::new(config).start().await
    }

    async fn launch(&self, listen: Vec<Multiaddr>, bootstrap_peer: Option<PeerInfo>) -> Result<()> {
        for address in listen {
            let bound = self.host.listen(address).await?;
            info!(address = %bound, "listening");
        }
        self.dht.start()?;
        self.exchange.start()?;

        match bootstrap_peer {
            None => match self.bootstrap_address() {
                Some(address) => info!(%address, "running as bootstrap node"),
                None => warn!("running as bootstrap node without a dialable address"),
            },
            Some(peer) => {
                info!(peer_id = %self.peer_id(), bootstrap = %peer.peer_id, "running as normal node");
                bootstrap::join(&self.host, &self.dht, peer, &self.config.bootstrap).await?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    pub fn peer_info(&self) -> PeerInfo {
        self.host.peer_info()
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.host.listen_addrs()
    }

    /// Address other nodes can use as their `bootstrap_address`.
    pub fn bootstrap_address(&self) -> Option<Multiaddr> {
        self.host.p2p_address()
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn dht(&self) -> &Arc<Dht> {
        &self.dht
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Encode `reader` into the local store and, when `provide_on_add` is
    /// set, announce every block. Announce failures leave the file added
    /// locally; the blocks stay queued for republishing.
    pub async fn add_file<R>(&self, reader: R) -> Result<EncodedFile>
    where
        R: AsyncRead + Unpin,
    {
        let encoded = self.dag.encode(reader, self.store.as_ref()).await?;
        info!(root = %encoded.root, size = encoded.size, blocks = encoded.blocks.len(), "added file");

        if self.config.provide_on_add {
            self.provide_all(&encoded).await;
        }
        Ok(encoded)
    }

    async fn provide_all(&self, encoded: &EncodedFile) {
        let dht = &self.dht;
        let failed = stream::iter(encoded.blocks.iter().copied())
            .map(|cid| async move { (cid, dht.provide(cid).await) })
            .buffer_unordered(PROVIDE_CONCURRENCY)
            .filter_map(|(cid, result)| async move {
                match result {
                    Ok(stored) => {
                        debug!(%cid, stored, "provided block");
                        None
                    }
                    Err(err) => {
                        debug!(%cid, "provide failed: {err}");
                        Some(cid)
                    }
                }
            })
            .count()
            .await;

        if failed > 0 {
            warn!(
                root = %encoded.root,
                failed,
                total = encoded.blocks.len(),
                "some blocks could not be announced; they will be republished"
            );
        }
    }

    /// Stream the file named by `root`. Stops when the node shuts down.
    pub fn get_file(&self, root: Cid) -> FileReader {
        self.get_file_with_cancel(root, self.cancel.child_token())
    }

    /// As [`Node::get_file`]; cancelling `cancel` ends the stream with
    /// [`NodeError::Cancelled`] and drops every request in flight.
    pub fn get_file_with_cancel(&self, root: Cid, cancel: CancellationToken) -> FileReader {
        let fetcher = NetworkFetcher {
            store: self.store.clone(),
            dht: self.dht.clone(),
            exchange: self.exchange.clone(),
            retries: self.config.fetch_retries,
            cancel,
        };
        let inner = DagReader::new(root, fetcher)
            .into_stream()
            .map_err(NodeError::from)
            .boxed();
        FileReader { root, inner }
    }

    /// Cancel running reads, stop background tasks and the host.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.exchange.shutdown().await;
        self.dht.shutdown().await;
        self.host.shutdown().await;
        if let Err(err) = self.store.flush() {
            warn!("failed to flush block store: {err}");
        }
        info!(peer_id = %self.peer_id(), "node stopped");
    }
}

/// Forward-only byte stream of one file, leaf by leaf.
pub struct FileReader {
    root: Cid,
    inner: BoxStream<'static, Result<Bytes>>,
}

impl FileReader {
    pub fn root(&self) -> Cid {
        self.root
    }

    /// Collect the whole file.
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.inner.try_next().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Write the file to `writer`, returning the number of bytes written.
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.inner.try_next().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }
}

impl Stream for FileReader {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Resolves blocks locally first, then from providers found on the DHT.
struct NetworkFetcher {
    store: Arc<dyn BlockStore>,
    dht: Arc<Dht>,
    exchange: Arc<BlockExchange>,
    retries: u32,
    cancel: CancellationToken,
}

#[async_trait]
impl BlockFetcher for NetworkFetcher {
    type Error = NodeError;

    async fn fetch(&self, cid: &Cid) -> Result<Bytes> {
        if self.cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NodeError::Cancelled),
            result = self.resolve(*cid) => result,
        }
    }
}

impl NetworkFetcher {
    async fn resolve(&self, cid: Cid) -> Result<Bytes> {
        if let Some(data) = self.local(&cid)? {
            return Ok(data);
        }

        let mut backoff = Backoff::new(FETCH_BACKOFF_INITIAL, FETCH_BACKOFF_MAX);
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(backoff.next_delay()).await;
            }
            match self.remote(cid).await {
                Ok(data) => return Ok(data),
                Err(err) => {
                    debug!(%cid, attempt, retries = self.retries, "remote fetch failed: {err}")
                }
            }
        }

        warn!(%cid, attempts = self.retries + 1, "block unavailable");
        Err(NodeError::ContentUnavailable(cid))
    }

    /// A verified local copy. A copy that fails verification is deleted.
    fn local(&self, cid: &Cid) -> Result<Option<Bytes>> {
        match self.store.get(cid) {
            Ok(data) if cid.verify(&data) => Ok(Some(data)),
            Ok(_) => {
                warn!(%cid, "discarding corrupt local block");
                self.store.delete(cid)?;
                Ok(None)
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn remote(&self, cid: Cid) -> Result<Bytes> {
        let providers = self.dht.find_providers(cid).await?;
        if providers.is_empty() {
            return Err(NodeError::ContentUnavailable(cid));
        }
        let block = self.exchange.fetch(cid, providers).await?;
        if let Err(err) = self.store.put(&block) {
            warn!(%cid, "failed to cache fetched block: {err}");
        }
        Ok(block.into_data())
    }
}
