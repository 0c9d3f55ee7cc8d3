use letslive_dag::{DagError, EncodeError};
use letslive_p2p::{DhtError, ExchangeError, HostError};
use letslive_storage::StoreError;
use letslive_types::Cid;

/// Errors reported by the node facade.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("bootstrap failed after {attempts} attempts: {reason}")]
    BootstrapFailed { attempts: u32, reason: String },
    #[error("content {0} is unavailable")]
    ContentUnavailable(Cid),
    #[error("integrity violation at {cid}: {reason}")]
    Integrity { cid: Cid, reason: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Dht(#[from] DhtError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for NodeError {
    fn from(err: ::config::ConfigError) -> Self {
        NodeError::Configuration(err.to_string())
    }
}

impl From<DagError<NodeError>> for NodeError {
    fn from(err: DagError<NodeError>) -> Self {
        match err {
            DagError::Fetch(err) => err,
            DagError::HashMismatch(cid) => NodeError::Integrity {
                cid,
                reason: "block does not hash to its cid".to_string(),
            },
            DagError::Decode { cid, source } => NodeError::Integrity {
                cid,
                reason: format!("not a valid dag node: {source}"),
            },
            DagError::SizeMismatch {
                cid,
                expected,
                actual,
            } => NodeError::Integrity {
                cid,
                reason: format!("covers {actual} bytes, expected {expected}"),
            },
            DagError::TooDeep { cid, max_depth } => NodeError::Integrity {
                cid,
                reason: format!("exceeds maximum depth {max_depth}"),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
