//! Shared primitives for the LetsLive storage node: content identifiers and
//! the immutable blocks they name.

pub mod block;
pub mod cid;

pub use block::Block;
pub use cid::{Cid, CidError, Codec, CID_LEN, DIGEST_LEN};
