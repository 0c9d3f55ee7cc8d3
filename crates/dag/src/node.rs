use bytes::Bytes;
use letslive_types::{Block, Cid, Codec, DIGEST_LEN};
use serde::{Deserialize, Serialize};

/// Reference to a child block and the number of file bytes beneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagLink {
    pub cid: Cid,
    pub size: u64,
}

/// Internal node of the file DAG. Holds links only, never file bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNode {
    pub links: Vec<DagLink>,
    pub total_size: u64,
}

impl DagNode {
    pub fn new(links: Vec<DagLink>) -> Self {
        let total_size = links.iter().map(|link| link.size).sum();
        Self { links, total_size }
    }

    /// Whether the declared total matches the sum of the link sizes.
    pub fn is_consistent(&self) -> bool {
        self.links
            .iter()
            .try_fold(0u64, |acc, link| acc.checked_add(link.size))
            == Some(self.total_size)
    }

    pub fn encode(&self) -> Result<Bytes, bincode::Error> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn to_block(&self) -> Result<Block, bincode::Error> {
        Ok(Block::new(Codec::DagNode, self.encode()?))
    }

    /// Upper bound on the encoded length of a node holding `fanout` links.
    pub fn max_encoded_len(fanout: usize) -> usize {
        // all-ones digest has the longest base58 form
        let widest = DagLink {
            cid: Cid::from_digest(Codec::DagNode, [0xff; DIGEST_LEN]),
            size: u64::MAX,
        };
        let link_len = encoded_len(&widest);
        let empty_len = encoded_len(&DagNode::new(Vec::new()));
        link_len.saturating_mul(fanout).saturating_add(empty_len)
    }
}

fn encoded_len<T: Serialize>(value: &T) -> usize {
    bincode::serialized_size(value).map_or(usize::MAX, |len| len as usize)
}
