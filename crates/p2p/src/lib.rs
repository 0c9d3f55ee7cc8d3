//! LetsLive peer-to-peer layer.
//!
//! - [`host`]: libp2p identity, TCP/Noise/Yamux transport and raw streams.
//! - [`wire`]: length-prefixed bincode framing used by every protocol.
//! - [`dht`]: Kademlia routing, peer lookup and provider records.
//! - [`exchange`]: block request/response between peers.

pub mod dht;
pub mod exchange;
pub mod host;
pub mod wire;

pub use dht::{Dht, DhtConfig, DhtError, FoundPeer, Key, RoutingTable, KAD_PROTOCOL};
pub use exchange::{BlockExchange, ExchangeConfig, ExchangeError, BLOCKS_PROTOCOL, MAX_BLOCK_LEN};
pub use host::{
    default_listen_address, peer_info_from_p2p_addr, ConnectionEvent, Host, HostConfig, HostError,
    PeerInfo,
};
pub use libp2p::identity::Keypair;
pub use libp2p::{Multiaddr, PeerId, StreamProtocol};
pub use wire::{WireError, MAX_FRAME_LEN};
