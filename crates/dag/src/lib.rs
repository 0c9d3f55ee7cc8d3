//! Merkle-DAG file layout.
//!
//! Files are split into fixed-size `Raw` leaves; leaves are grouped under
//! `DagNode` link blocks until a single root remains. The root CID names the
//! whole file and every block below it is verified on the way back out.

pub mod builder;
pub mod chunker;
pub mod node;
pub mod reader;

pub use builder::{DagBuilder, EncodeError, EncodedFile};
pub use chunker::Chunker;
pub use node::{DagLink, DagNode};
pub use reader::{BlockFetcher, DagError, DagReader, StoreFetcher, DEFAULT_MAX_DEPTH};

use serde::{Deserialize, Serialize};

/// Default leaf size: 256 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Default number of links per internal node.
pub const DEFAULT_MAX_FANOUT: usize = 174;

/// Shape parameters for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DagConfig {
    pub chunk_size: usize,
    pub max_fanout: usize,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_fanout: DEFAULT_MAX_FANOUT,
        }
    }
}

impl DagConfig {
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.chunk_size == 0 {
            return Err(EncodeError::InvalidConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.max_fanout < 2 {
            return Err(EncodeError::InvalidConfig(format!(
                "max_fanout must be at least 2, got {}",
                self.max_fanout
            )));
        }
        Ok(())
    }

    /// Reject layouts whose leaves or link nodes can grow past `limit` bytes.
    pub fn check_block_limit(&self, limit: usize) -> Result<(), EncodeError> {
        if self.chunk_size > limit {
            return Err(EncodeError::InvalidConfig(format!(
                "chunk_size {} exceeds the {limit} byte block limit",
                self.chunk_size
            )));
        }
        let link_len = DagNode::max_encoded_len(self.max_fanout);
        if link_len > limit {
            return Err(EncodeError::InvalidConfig(format!(
                "max_fanout {} allows link blocks of {link_len} bytes, over the {limit} byte block limit",
                self.max_fanout
            )));
        }
        Ok(())
    }
}
