use crate::cid::{Cid, Codec};
use bytes::Bytes;

/// An immutable block: bytes paired with the CID they hash to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    /// Hash `data` under `codec` and wrap it.
    pub fn new(codec: Codec, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let cid = Cid::new(codec, &data);
        Self { cid, data }
    }

    /// Pair bytes with a CID received from elsewhere, without hashing.
    ///
    /// Callers that accept such blocks must check [`Block::verify`] (the block
    /// store does so on `put`).
    pub fn from_parts(cid: Cid, data: impl Into<Bytes>) -> Self {
        Self {
            cid,
            data: data.into(),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// The CID recomputed from the block's bytes under its declared codec.
    pub fn computed_cid(&self) -> Cid {
        Cid::new(self.cid.codec(), &self.data)
    }

    pub fn verify(&self) -> bool {
        self.cid.verify(&self.data)
    }
}
