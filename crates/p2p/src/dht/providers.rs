//! Provider records: which peers announced they hold a CID.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use letslive_types::Cid;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;

use crate::host::PeerInfo;

#[derive(Debug, Clone)]
struct ProviderRecord {
    addrs: Vec<Multiaddr>,
    expires: Instant,
}

/// Expiring `Cid → {PeerId → addresses}` map.
pub struct ProviderStore {
    ttl: Duration,
    max_per_key: usize,
    records: RwLock<HashMap<Cid, HashMap<PeerId, ProviderRecord>>>,
}

impl ProviderStore {
    pub fn new(ttl: Duration, max_per_key: usize) -> Self {
        Self {
            ttl,
            max_per_key: max_per_key.max(1),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Add or re-announce a provider. Returns `false` when the record set for
    /// `cid` is full and `provider` is not already in it.
    pub fn add(&self, cid: Cid, provider: PeerInfo) -> bool {
        let now = Instant::now();
        let mut records = self.records.write();
        let entry = records.entry(cid).or_default();
        entry.retain(|_, record| record.expires > now);

        if !entry.contains_key(&provider.peer_id) && entry.len() >= self.max_per_key {
            return false;
        }
        let record = entry.entry(provider.peer_id).or_insert(ProviderRecord {
            addrs: Vec::new(),
            expires: now,
        });
        if !provider.addrs.is_empty() {
            record.addrs = provider.addrs;
        }
        record.expires = now + self.ttl;
        true
    }

    /// Unexpired providers of `cid`.
    pub fn providers(&self, cid: &Cid) -> Vec<PeerInfo> {
        let now = Instant::now();
        self.records
            .read()
            .get(cid)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|(_, record)| record.expires > now)
                    .map(|(peer_id, record)| PeerInfo::new(*peer_id, record.addrs.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired records; returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut records = self.records.write();
        records.retain(|_, entry| {
            let before = entry.len();
            entry.retain(|_, record| record.expires > now);
            removed += before - entry.len();
            !entry.is_empty()
        });
        removed
    }

    /// Number of CIDs with at least one record.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use letslive_types::Codec;
    use libp2p::identity::Keypair;

    fn provider() -> PeerInfo {
        PeerInfo::new(
            Keypair::generate_ed25519().public().to_peer_id(),
            vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
        )
    }

    #[test]
    fn records_expire() {
        let store = ProviderStore::new(Duration::from_millis(20), 20);
        let cid = Cid::new(Codec::Raw, b"segment");
        let peer = provider();

        assert!(store.add(cid, peer.clone()));
        assert_eq!(store.providers(&cid), vec![peer]);

        std::thread::sleep(Duration::from_millis(40));
        assert!(store.providers(&cid).is_empty());
        assert_eq!(store.remove_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn reannounce_refreshes_instead_of_duplicating() {
        let store = ProviderStore::new(Duration::from_secs(60), 20);
        let cid = Cid::new(Codec::Raw, b"segment");
        let peer = provider();
        store.add(cid, peer.clone());
        store.add(cid, PeerInfo::new(peer.peer_id, Vec::new()));
        assert_eq!(store.providers(&cid), vec![peer]);
    }

    #[test]
    fn caps_providers_per_cid() {
        let store = ProviderStore::new(Duration::from_secs(60), 2);
        let cid = Cid::new(Codec::DagNode, b"root");
        let first = provider();
        assert!(store.add(cid, first.clone()));
        assert!(store.add(cid, provider()));
        assert!(!store.add(cid, provider()));
        assert!(store.add(cid, first));
        assert_eq!(store.providers(&cid).len(), 2);
    }
}
