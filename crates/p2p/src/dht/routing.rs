//! Kademlia keys, XOR distance and the k-bucket routing table.

use std::fmt;
use std::time::{Duration, Instant};

use letslive_types::Cid;
use libp2p::PeerId;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::host::PeerInfo;

pub const KEY_LEN: usize = 32;

/// One bucket per possible common-prefix length.
pub const NUM_BUCKETS: usize = KEY_LEN * 8;

/// Consecutive failed RPCs after which an entry is dropped.
pub const MAX_FAILURES: u32 = 3;

/// Point in the 256-bit keyspace shared by peers and content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn from_peer(peer_id: &PeerId) -> Self {
        Self(*blake3::hash(&peer_id.to_bytes()).as_bytes())
    }

    pub fn from_cid(cid: &Cid) -> Self {
        Self(*blake3::hash(&cid.to_bytes()).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &Key) -> Distance {
        let mut out = [0u8; KEY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        f.write_str("…)")
    }
}

/// XOR distance between two keys, ordered as a big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Distance([u8; KEY_LEN]);

impl Distance {
    /// Length of the common prefix of the two keys that produced this distance.
    pub fn leading_zeros(&self) -> usize {
        let mut zeros = 0;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    /// Bucket holding keys at this distance; `None` for the local key itself.
    pub fn bucket_index(&self) -> Option<usize> {
        let zeros = self.leading_zeros();
        (zeros < NUM_BUCKETS).then_some(zeros)
    }
}

/// Result of offering a peer to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    Updated,
    /// The bucket was full and the new peer displaced a failing or farther one.
    Replaced { evicted: PeerId },
    /// The bucket was full and every entry was closer or as close.
    Dropped,
    /// Local peer, or an unknown peer with no addresses.
    Ignored,
}

#[derive(Debug, Clone)]
struct Entry {
    info: PeerInfo,
    key: Key,
    last_contact: Instant,
    failures: u32,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: Vec<Entry>,
}

/// Routing table of 256 k-buckets, each behind its own lock.
pub struct RoutingTable {
    local_id: PeerId,
    local_key: Key,
    k: usize,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    pub fn new(local_id: PeerId, k: usize) -> Self {
        Self {
            local_id,
            local_key: Key::from_peer(&local_id),
            k: k.max(1),
            buckets: (0..NUM_BUCKETS).map(|_| Mutex::new(Bucket::default())).collect(),
        }
    }

    pub fn local_key(&self) -> Key {
        self.local_key
    }

    /// Record contact with a peer.
    ///
    /// Known peers get their addresses and contact time refreshed and their
    /// failure count cleared. New peers are appended while the bucket has
    /// room. In a full bucket the entry with the most failures is replaced
    /// first; with none failing, the least-recently-contacted entry is
    /// replaced only if the newcomer is closer to the local key.
    pub fn update(&self, info: PeerInfo) -> UpdateOutcome {
        if info.peer_id == self.local_id {
            return UpdateOutcome::Ignored;
        }
        let key = Key::from_peer(&info.peer_id);
        let distance = self.local_key.distance(&key);
        let Some(index) = distance.bucket_index() else {
            return UpdateOutcome::Ignored;
        };

        let now = Instant::now();
        let mut bucket = self.buckets[index].lock();
        if let Some(entry) = bucket
            .entries
            .iter_mut()
            .find(|entry| entry.info.peer_id == info.peer_id)
        {
            if !info.addrs.is_empty() {
                entry.info.addrs = info.addrs;
            }
            entry.last_contact = now;
            entry.failures = 0;
            return UpdateOutcome::Updated;
        }

        if info.addrs.is_empty() {
            return UpdateOutcome::Ignored;
        }

        let entry = Entry {
            info,
            key,
            last_contact: now,
            failures: 0,
        };
        if bucket.entries.len() < self.k {
            bucket.entries.push(entry);
            return UpdateOutcome::Inserted;
        }

        let failing = bucket
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.failures > 0)
            .max_by(|(_, a), (_, b)| {
                a.failures
                    .cmp(&b.failures)
                    .then(b.last_contact.cmp(&a.last_contact))
            })
            .map(|(position, entry)| (position, entry.info.peer_id));
        if let Some((position, evicted)) = failing {
            bucket.entries[position] = entry;
            return UpdateOutcome::Replaced { evicted };
        }

        let Some((position, stalest)) = bucket
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.last_contact)
        else {
            return UpdateOutcome::Dropped;
        };
        if distance < self.local_key.distance(&stalest.key) {
            let evicted = stalest.info.peer_id;
            bucket.entries[position] = entry;
            UpdateOutcome::Replaced { evicted }
        } else {
            UpdateOutcome::Dropped
        }
    }

    pub fn remove(&self, peer_id: &PeerId) -> bool {
        let Some(index) = self.index_of(peer_id) else {
            return false;
        };
        let mut bucket = self.buckets[index].lock();
        let before = bucket.entries.len();
        bucket.entries.retain(|entry| entry.info.peer_id != *peer_id);
        bucket.entries.len() != before
    }

    /// Count a failed RPC against `peer_id`. Returns true when the entry
    /// reached [`MAX_FAILURES`] and was dropped.
    pub fn record_failure(&self, peer_id: &PeerId) -> bool {
        let Some(index) = self.index_of(peer_id) else {
            return false;
        };
        let mut bucket = self.buckets[index].lock();
        let Some(position) = bucket
            .entries
            .iter()
            .position(|entry| entry.info.peer_id == *peer_id)
        else {
            return false;
        };
        bucket.entries[position].failures += 1;
        if bucket.entries[position].failures >= MAX_FAILURES {
            bucket.entries.remove(position);
            true
        } else {
            false
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        let index = self.index_of(peer_id)?;
        let bucket = self.buckets[index].lock();
        bucket
            .entries
            .iter()
            .find(|entry| entry.info.peer_id == *peer_id)
            .map(|entry| entry.info.clone())
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.get(peer_id).is_some()
    }

    /// Up to `count` peers ordered by distance to `target`.
    pub fn closest(&self, target: &Key, count: usize) -> Vec<PeerInfo> {
        let mut all: Vec<(Distance, PeerInfo)> = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            all.extend(
                bucket
                    .entries
                    .iter()
                    .map(|entry| (target.distance(&entry.key), entry.info.clone())),
            );
        }
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.into_iter().take(count).map(|(_, info)| info).collect()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .lock()
                    .entries
                    .iter()
                    .map(|entry| entry.info.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries whose last RPC did not fail.
    pub fn responsive_len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| {
                bucket
                    .lock()
                    .entries
                    .iter()
                    .filter(|entry| entry.failures == 0)
                    .count()
            })
            .sum()
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets
            .get(index)
            .map(|bucket| bucket.lock().entries.len())
            .unwrap_or(0)
    }

    /// Non-empty buckets with no contact for at least `max_age`.
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(index, bucket)| {
                let bucket = bucket.lock();
                let newest = bucket.entries.iter().map(|entry| entry.last_contact).max()?;
                (now.duration_since(newest) >= max_age).then_some(index)
            })
            .collect()
    }

    /// A random key whose common prefix with the local key is exactly `index` bits.
    pub fn random_key_in_bucket(&self, index: usize) -> Key {
        let index = index.min(NUM_BUCKETS - 1);
        let mut distance = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut distance);

        let byte = index / 8;
        let bit = index % 8;
        for b in distance.iter_mut().take(byte) {
            *b = 0;
        }
        let top = 0x80u8 >> bit;
        // keep bits below `top`, clear the ones above, set `top`
        distance[byte] = (distance[byte] & (top - 1)) | top;

        let mut key = [0u8; KEY_LEN];
        for (i, out) in key.iter_mut().enumerate() {
            *out = self.local_key.0[i] ^ distance[i];
        }
        Key(key)
    }

    fn index_of(&self, peer_id: &PeerId) -> Option<usize> {
        self.local_key
            .distance(&Key::from_peer(peer_id))
            .bucket_index()
    }
}
