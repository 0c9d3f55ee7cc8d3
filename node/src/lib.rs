//! LetsLive storage node.
//!
//! Stores immutable blocks locally, finds peers and content holders through
//! the DHT and exchanges blocks with them. Files go in with
//! [`Node::add_file`] and come back, verified block by block, with
//! [`Node::get_file`].

mod bootstrap;
pub mod config;
pub mod error;
pub mod node;

pub use self::config::{
    default_data_dir, load_or_create_keypair, BootstrapSettings, DhtSettings, ExchangeSettings,
    IdentityConfig, LogFormat, NodeConfig, Role,
};
pub use error::{NodeError, Result};
pub use node::{FileReader, Node, NodeBuilder};

pub use letslive_dag::{DagConfig, EncodedFile};
pub use letslive_types::{Block, Cid, Codec};
pub use tokio_util::sync::CancellationToken;
