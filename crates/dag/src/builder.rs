use crate::chunker::Chunker;
use crate::node::{DagLink, DagNode};
use crate::DagConfig;
use bytes::Bytes;
use letslive_storage::{BlockStore, StoreError};
use letslive_types::{Block, Cid, Codec};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::AsyncRead;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("failed to store block: {0}")]
    Store(#[from] StoreError),
    #[error("failed to encode dag node: {0}")]
    Encode(#[from] bincode::Error),
    #[error("invalid dag configuration: {0}")]
    InvalidConfig(String),
}

/// Outcome of encoding one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedFile {
    pub root: Cid,
    /// File length in bytes.
    pub size: u64,
    /// Every block written, leaves first, root last.
    pub blocks: Vec<Cid>,
}

/// Writes files into a block store as Merkle DAGs.
#[derive(Debug, Clone, Default)]
pub struct DagBuilder {
    config: DagConfig,
}

impl DagBuilder {
    pub fn new(config: DagConfig) -> Result<Self, EncodeError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DagConfig {
        &self.config
    }

    /// Chunk `reader` into leaves, link them up level by level and return the
    /// root. Equal input under equal configuration always yields the same root.
    pub async fn encode<R, S>(&self, reader: R, store: &S) -> Result<EncodedFile, EncodeError>
    where
        R: AsyncRead + Unpin,
        S: BlockStore + ?Sized,
    {
        let mut chunker = Chunker::new(reader, self.config.chunk_size);
        let mut level = Vec::new();
        let mut blocks = Vec::new();
        let mut size = 0u64;

        while let Some(chunk) = chunker.next_chunk().await? {
            let link = put_leaf(store, chunk)?;
            size += link.size;
            blocks.push(link.cid);
            level.push(link);
        }

        if level.is_empty() {
            let link = put_leaf(store, Bytes::new())?;
            blocks.push(link.cid);
            level.push(link);
        }

        let mut depth = 0usize;
        while level.len() > 1 {
            let mut parents = Vec::with_capacity(level.len().div_ceil(self.config.max_fanout));
            for group in level.chunks(self.config.max_fanout) {
                let node = DagNode::new(group.to_vec());
                let block = node.to_block()?;
                store.put(&block)?;
                blocks.push(*block.cid());
                parents.push(DagLink {
                    cid: *block.cid(),
                    size: node.total_size,
                });
            }
            level = parents;
            depth += 1;
        }

        let root = level[0].cid;
        debug!(%root, size, blocks = blocks.len(), depth, "encoded file");
        Ok(EncodedFile { root, size, blocks })
    }
}

fn put_leaf<S: BlockStore + ?Sized>(store: &S, data: Bytes) -> Result<DagLink, EncodeError> {
    let block = Block::new(Codec::Raw, data);
    store.put(&block)?;
    Ok(DagLink {
        cid: *block.cid(),
        size: block.len() as u64,
    })
}
