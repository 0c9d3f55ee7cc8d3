//! Content-addressed block storage.
//!
//! Every block is keyed by its [`Cid`]. Writers hand over a [`Block`] and the
//! store recomputes the identifier from the bytes before accepting it, so a
//! store never holds content under a CID it does not hash to.

use bytes::Bytes;
use letslive_types::{Block, Cid};
use parking_lot::RwLock;
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("block hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: Cid, actual: Cid },
    #[error("block not found: {0}")]
    NotFound(Cid),
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("corrupt key in block tree: {0}")]
    CorruptKey(#[from] letslive_types::CidError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Abstract block store.
///
/// Implementations synchronize internally; every method takes `&self` and a
/// single `put`/`get` of one key is atomic.
pub trait BlockStore: Send + Sync {
    /// Store a block after checking that its bytes hash to its CID.
    /// Storing identical content twice is a no-op.
    fn put(&self, block: &Block) -> Result<()>;
    fn get(&self, cid: &Cid) -> Result<Bytes>;
    fn has(&self, cid: &Cid) -> Result<bool>;
    /// Remove a block. Deleting a missing block succeeds.
    fn delete(&self, cid: &Cid) -> Result<()>;
    fn len(&self) -> Result<usize>;
    fn cids(&self) -> Result<Vec<Cid>>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Persist buffered writes. No-op for volatile stores.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    fn put(&self, block: &Block) -> Result<()> {
        (**self).put(block)
    }

    fn get(&self, cid: &Cid) -> Result<Bytes> {
        (**self).get(cid)
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        (**self).has(cid)
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        (**self).delete(cid)
    }

    fn len(&self) -> Result<usize> {
        (**self).len()
    }

    fn cids(&self) -> Result<Vec<Cid>> {
        (**self).cids()
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

fn check_integrity(block: &Block) -> Result<()> {
    let actual = block.computed_cid();
    if actual != *block.cid() {
        return Err(StoreError::HashMismatch {
            expected: *block.cid(),
            actual,
        });
    }
    Ok(())
}

/// Sled-backed implementation
pub struct SledBlockStore {
    db: Db,
    blocks: Tree,
}

impl SledBlockStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;
        Ok(Self { db, blocks })
    }
}

impl BlockStore for SledBlockStore {
    fn put(&self, block: &Block) -> Result<()> {
        check_integrity(block)?;
        let key = block.cid().to_bytes();
        // Content addressing makes an existing entry identical; keep it.
        let previous = self
            .blocks
            .compare_and_swap(key, None as Option<&[u8]>, Some(block.data().as_ref()))?;
        if previous.is_ok() {
            debug!(cid = %block.cid(), len = block.len(), "stored block");
        }
        Ok(())
    }

    fn get(&self, cid: &Cid) -> Result<Bytes> {
        match self.blocks.get(cid.to_bytes())? {
            Some(value) => Ok(Bytes::copy_from_slice(&value)),
            None => Err(StoreError::NotFound(*cid)),
        }
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.contains_key(cid.to_bytes())?)
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        self.blocks.remove(cid.to_bytes())?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.blocks.len())
    }

    fn cids(&self) -> Result<Vec<Cid>> {
        let mut out = Vec::with_capacity(self.blocks.len());
        for item in self.blocks.iter().keys() {
            out.push(Cid::from_slice(&item?)?);
        }
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory implementation
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<Cid, Bytes>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, block: &Block) -> Result<()> {
        check_integrity(block)?;
        self.blocks
            .write()
            .entry(*block.cid())
            .or_insert_with(|| block.data().clone());
        Ok(())
    }

    fn get(&self, cid: &Cid) -> Result<Bytes> {
        self.blocks
            .read()
            .get(cid)
            .cloned()
            .ok_or(StoreError::NotFound(*cid))
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.read().contains_key(cid))
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        self.blocks.write().remove(cid);
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.blocks.read().len())
    }

    fn cids(&self) -> Result<Vec<Cid>> {
        Ok(self.blocks.read().keys().copied().collect())
    }
}
