use crate::node::DagNode;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use letslive_storage::{BlockStore, StoreError};
use letslive_types::{Cid, Codec};
use std::sync::Arc;

/// Maximum number of link levels followed below a root.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Source of raw block bytes for DAG reads.
///
/// Implementations decide where bytes come from (local store, network, both).
/// The reader verifies every returned block against its CID itself.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn fetch(&self, cid: &Cid) -> Result<Bytes, Self::Error>;
}

#[async_trait]
impl<F: BlockFetcher + ?Sized> BlockFetcher for Arc<F> {
    type Error = F::Error;

    async fn fetch(&self, cid: &Cid) -> Result<Bytes, Self::Error> {
        (**self).fetch(cid).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DagError<E: std::error::Error + 'static> {
    #[error("failed to fetch block: {0}")]
    Fetch(#[source] E),
    #[error("block {0} does not hash to its cid")]
    HashMismatch(Cid),
    #[error("block {cid} is not a valid dag node: {source}")]
    Decode {
        cid: Cid,
        #[source]
        source: bincode::Error,
    },
    #[error("block {cid} covers {actual} bytes, expected {expected}")]
    SizeMismatch { cid: Cid, expected: u64, actual: u64 },
    #[error("dag exceeds maximum depth {max_depth} at {cid}")]
    TooDeep { cid: Cid, max_depth: usize },
}

/// Local-only fetcher over a block store.
#[derive(Clone)]
pub struct StoreFetcher<S> {
    store: S,
}

impl<S: BlockStore> StoreFetcher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: BlockStore> BlockFetcher for StoreFetcher<S> {
    type Error = StoreError;

    async fn fetch(&self, cid: &Cid) -> Result<Bytes, StoreError> {
        self.store.get(cid)
    }
}

/// Reads a file back out of its DAG, in order, one leaf at a time.
pub struct DagReader<F> {
    root: Cid,
    fetcher: F,
    max_depth: usize,
}

struct Frame {
    cid: Cid,
    expected: Option<u64>,
    depth: usize,
}

struct Walk<F> {
    fetcher: F,
    stack: Vec<Frame>,
    max_depth: usize,
}

impl<F: BlockFetcher + 'static> DagReader<F> {
    pub fn new(root: Cid, fetcher: F) -> Self {
        Self {
            root,
            fetcher,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Leaf contents in file order. Nothing is fetched until the stream is
    /// polled, and dropping the stream drops any fetch in progress.
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, DagError<F::Error>>> {
        let walk = Walk {
            fetcher: self.fetcher,
            stack: vec![Frame {
                cid: self.root,
                expected: None,
                depth: 0,
            }],
            max_depth: self.max_depth,
        };

        stream::try_unfold(walk, |mut walk| async move {
            let leaf = walk.next_leaf().await?;
            Ok::<_, DagError<F::Error>>(leaf.map(|leaf| (leaf, walk)))
        })
        .boxed()
    }

    pub async fn read_to_end(self) -> Result<Bytes, DagError<F::Error>> {
        let mut leaves = self.into_stream();
        let mut out = BytesMut::new();
        while let Some(leaf) = leaves.try_next().await? {
            out.extend_from_slice(&leaf);
        }
        Ok(out.freeze())
    }
}

impl<F: BlockFetcher> Walk<F> {
    async fn next_leaf(&mut self) -> Result<Option<Bytes>, DagError<F::Error>> {
        while let Some(frame) = self.stack.pop() {
            let data = self
                .fetcher
                .fetch(&frame.cid)
                .await
                .map_err(DagError::Fetch)?;
            if !frame.cid.verify(&data) {
                return Err(DagError::HashMismatch(frame.cid));
            }

            match frame.cid.codec() {
                Codec::Raw => {
                    check_size(&frame, data.len() as u64)?;
                    return Ok(Some(data));
                }
                Codec::DagNode => {
                    let node = DagNode::decode(&data).map_err(|source| DagError::Decode {
                        cid: frame.cid,
                        source,
                    })?;
                    if !node.is_consistent() {
                        return Err(DagError::SizeMismatch {
                            cid: frame.cid,
                            expected: node.total_size,
                            actual: node
                                .links
                                .iter()
                                .fold(0u64, |acc, link| acc.saturating_add(link.size)),
                        });
                    }
                    check_size(&frame, node.total_size)?;
                    if !node.links.is_empty() && frame.depth >= self.max_depth {
                        return Err(DagError::TooDeep {
                            cid: frame.cid,
                            max_depth: self.max_depth,
                        });
                    }
                    self.stack.extend(node.links.iter().rev().map(|link| Frame {
                        cid: link.cid,
                        expected: Some(link.size),
                        depth: frame.depth + 1,
                    }));
                }
            }
        }
        Ok(None)
    }
}

fn check_size<E: std::error::Error + 'static>(
    frame: &Frame,
    actual: u64,
) -> Result<(), DagError<E>> {
    match frame.expected {
        Some(expected) if expected != actual => Err(DagError::SizeMismatch {
            cid: frame.cid,
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}
