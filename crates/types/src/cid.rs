use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of the BLAKE3 digest carried by every CID.
pub const DIGEST_LEN: usize = 32;

/// Length of the binary CID encoding: one codec byte followed by the digest.
pub const CID_LEN: usize = 1 + DIGEST_LEN;

/// Errors emitted when decoding content identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidError {
    #[error("cid must be {CID_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("unknown cid codec 0x{0:02x}")]
    UnknownCodec(u8),
    #[error("cid must be valid base58: {0}")]
    InvalidBase58(String),
}

/// Type tag distinguishing file data from link nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Codec {
    /// Leaf block holding raw file bytes.
    Raw,
    /// Internal Merkle-DAG node holding only links.
    DagNode,
}

impl Codec {
    pub const fn code(self) -> u8 {
        match self {
            Codec::Raw => 0x55,
            Codec::DagNode => 0x71,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CidError> {
        match code {
            0x55 => Ok(Codec::Raw),
            0x71 => Ok(Codec::DagNode),
            other => Err(CidError::UnknownCodec(other)),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Codec::Raw => "raw",
            Codec::DagNode => "dag-node",
        };
        f.write_str(value)
    }
}

/// Content identifier: the BLAKE3 digest of a block's bytes plus its codec.
///
/// Two blocks with equal bytes but different codecs have different CIDs, so a
/// leaf can never be mistaken for a link node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid {
    codec: Codec,
    digest: [u8; DIGEST_LEN],
}

impl Cid {
    /// Hash `data` and tag it with `codec`.
    pub fn new(codec: Codec, data: &[u8]) -> Self {
        Self {
            codec,
            digest: *blake3::hash(data).as_bytes(),
        }
    }

    /// Build from an already computed digest.
    pub fn from_digest(codec: Codec, digest: [u8; DIGEST_LEN]) -> Self {
        Self { codec, digest }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Whether `data` hashes to this CID.
    pub fn verify(&self, data: &[u8]) -> bool {
        blake3::hash(data).as_bytes() == &self.digest
    }

    /// Binary encoding: codec byte followed by the digest.
    pub fn to_bytes(&self) -> [u8; CID_LEN] {
        let mut out = [0u8; CID_LEN];
        out[0] = self.codec.code();
        out[1..].copy_from_slice(&self.digest);
        out
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CidError> {
        if bytes.len() != CID_LEN {
            return Err(CidError::InvalidLength(bytes.len()));
        }
        let codec = Codec::from_code(bytes[0])?;
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[1..]);
        Ok(Self { codec, digest })
    }

    /// Base58btc rendering of the binary encoding.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({}, {})", self.codec, self.to_base58())
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|err| CidError::InvalidBase58(err.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl From<Cid> for String {
    fn from(value: Cid) -> Self {
        value.to_base58()
    }
}

impl TryFrom<String> for Cid {
    type Error = CidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_is_deterministic() {
        let a = Cid::new(Codec::Raw, b"segment-0001.ts");
        let b = Cid::new(Codec::Raw, b"segment-0001.ts");
        assert_eq!(a, b);
        assert!(a.verify(b"segment-0001.ts"));
        assert!(!a.verify(b"segment-0002.ts"));
    }

    #[test]
    fn codec_is_part_of_identity() {
        let leaf = Cid::new(Codec::Raw, b"same bytes");
        let node = Cid::new(Codec::DagNode, b"same bytes");
        assert_ne!(leaf, node);
        assert_eq!(leaf.digest(), node.digest());
    }

    #[test]
    fn parses_its_own_text_form() {
        let cid = Cid::new(Codec::DagNode, b"playlist");
        let text = cid.to_string();
        let parsed: Cid = text.parse().expect("valid cid");
        assert_eq!(parsed, cid);
        assert_eq!(parsed.codec(), Codec::DagNode);
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(matches!(
            "0OIl".parse::<Cid>(),
            Err(CidError::InvalidBase58(_))
        ));
        let short = bs58::encode([0x55u8; 4]).into_string();
        assert_eq!(short.parse::<Cid>(), Err(CidError::InvalidLength(4)));

        let mut bytes = Cid::new(Codec::Raw, b"x").to_bytes();
        bytes[0] = 0x01;
        assert_eq!(Cid::from_slice(&bytes), Err(CidError::UnknownCodec(0x01)));
    }

    #[test]
    fn serializes_as_text() {
        let cid = Cid::new(Codec::Raw, b"hello");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{}\"", cid));
        let back: Cid = bincode::deserialize(&bincode::serialize(&cid).unwrap()).unwrap();
        assert_eq!(back, cid);
    }
}
