//! Candidate bookkeeping for iterative lookups.

use std::collections::BTreeMap;

use libp2p::PeerId;

use super::routing::{Distance, Key};
use crate::host::PeerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    NotQueried,
    Queried,
    Succeeded,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    info: PeerInfo,
    status: Status,
}

/// Peers known to a lookup, ordered by distance to its target.
#[derive(Debug)]
pub(crate) struct LookupState {
    target: Key,
    local: PeerId,
    k: usize,
    candidates: BTreeMap<Distance, Candidate>,
}

impl LookupState {
    pub(crate) fn new(target: Key, local: PeerId, k: usize, seeds: Vec<PeerInfo>) -> Self {
        let mut state = Self {
            target,
            local,
            k,
            candidates: BTreeMap::new(),
        };
        for seed in seeds {
            state.insert(seed);
        }
        state
    }

    /// Add a newly learned peer. Returns `true` if it was not known before.
    pub(crate) fn insert(&mut self, info: PeerInfo) -> bool {
        if info.peer_id == self.local {
            return false;
        }
        let distance = self.target.distance(&Key::from_peer(&info.peer_id));
        match self.candidates.get_mut(&distance) {
            Some(existing) => {
                if existing.info.addrs.is_empty() && !info.addrs.is_empty() {
                    existing.info.addrs = info.addrs;
                }
                false
            }
            None => {
                self.candidates.insert(
                    distance,
                    Candidate {
                        info,
                        status: Status::NotQueried,
                    },
                );
                true
            }
        }
    }

    /// Distance of the closest candidate that has not failed.
    pub(crate) fn best(&self) -> Option<Distance> {
        self.candidates
            .iter()
            .find(|(_, candidate)| candidate.status != Status::Failed)
            .map(|(distance, _)| *distance)
    }

    /// Take the `alpha` closest unqueried candidates and mark them queried.
    pub(crate) fn next_batch(&mut self, alpha: usize) -> Vec<PeerInfo> {
        self.candidates
            .values_mut()
            .filter(|candidate| candidate.status == Status::NotQueried)
            .take(alpha)
            .map(|candidate| {
                candidate.status = Status::Queried;
                candidate.info.clone()
            })
            .collect()
    }

    /// Take every unqueried candidate among the `k` closest live ones.
    pub(crate) fn remaining_in_closest(&mut self) -> Vec<PeerInfo> {
        self.candidates
            .values_mut()
            .filter(|candidate| candidate.status != Status::Failed)
            .take(self.k)
            .filter(|candidate| candidate.status == Status::NotQueried)
            .map(|candidate| {
                candidate.status = Status::Queried;
                candidate.info.clone()
            })
            .collect()
    }

    pub(crate) fn succeeded(&mut self, peer_id: &PeerId) {
        self.set_status(peer_id, Status::Succeeded);
    }

    pub(crate) fn failed(&mut self, peer_id: &PeerId) {
        self.set_status(peer_id, Status::Failed);
    }

    pub(crate) fn get(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        let distance = self.target.distance(&Key::from_peer(peer_id));
        self.candidates
            .get(&distance)
            .filter(|candidate| candidate.status != Status::Failed)
            .map(|candidate| &candidate.info)
    }

    /// The `k` closest candidates that have not failed.
    pub(crate) fn closest(&self) -> Vec<PeerInfo> {
        self.candidates
            .values()
            .filter(|candidate| candidate.status != Status::Failed)
            .take(self.k)
            .map(|candidate| candidate.info.clone())
            .collect()
    }

    fn set_status(&mut self, peer_id: &PeerId, status: Status) {
        let distance = self.target.distance(&Key::from_peer(peer_id));
        if let Some(candidate) = self.candidates.get_mut(&distance) {
            candidate.status = status;
        }
    }
}

/// Whether `after` is strictly closer than `before`.
pub(crate) fn made_progress(before: Option<Distance>, after: Option<Distance>) -> bool {
    match (before, after) {
        (Some(before), Some(after)) => after < before,
        (None, Some(_)) => true,
        _ => false,
    }
}
