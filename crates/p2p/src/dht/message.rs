use letslive_types::Cid;
use serde::{Deserialize, Serialize};

use super::routing::Key;
use crate::host::PeerInfo;

/// Every request names its sender so the receiver can update its table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtRequest {
    pub sender: PeerInfo,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    FindNode { key: Key },
    GetProviders { cid: Cid },
    /// Announce the sender (as authenticated by the connection) as a provider.
    AddProvider { cid: Cid },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtResponse {
    Nodes {
        closer: Vec<PeerInfo>,
    },
    Providers {
        providers: Vec<PeerInfo>,
        closer: Vec<PeerInfo>,
    },
    ProviderAdded,
    Pong,
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::FindNode { .. } => "find_node",
            RequestBody::GetProviders { .. } => "get_providers",
            RequestBody::AddProvider { .. } => "add_provider",
            RequestBody::Ping => "ping",
        }
    }
}
