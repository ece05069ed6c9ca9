//! Outstanding header assignments, indexed by hash, height and peer.

use super::types::AssignedDownload;
use crate::p2p::PeerId;
use alloy_primitives::B256;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct AssignmentTable {
    by_hash: HashMap<B256, AssignedDownload>,
    by_height: BTreeSet<(u64, B256)>,
    by_peer: HashMap<PeerId, HashSet<B256>>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the hash is already assigned.
    pub fn insert(&mut self, assigned: AssignedDownload) -> bool {
        let hash = assigned.hash();
        if self.by_hash.contains_key(&hash) {
            return false;
        }
        self.by_height.insert((assigned.height(), hash));
        self.by_peer.entry(assigned.peer_id).or_default().insert(hash);
        self.by_hash.insert(hash, assigned);
        true
    }

    pub fn get(&self, hash: &B256) -> Option<&AssignedDownload> {
        self.by_hash.get(hash)
    }

    pub fn remove(&mut self, hash: &B256) -> Option<AssignedDownload> {
        let assigned = self.by_hash.remove(hash)?;
        self.by_height.remove(&(assigned.height(), *hash));
        if let Some(hashes) = self.by_peer.get_mut(&assigned.peer_id) {
            hashes.remove(hash);
            if hashes.is_empty() {
                self.by_peer.remove(&assigned.peer_id);
            }
        }
        Some(assigned)
    }

    /// Remove everything assigned to `peer_id`, lowest height first.
    pub fn release_peer(&mut self, peer_id: PeerId) -> Vec<AssignedDownload> {
        let Some(hashes) = self.by_peer.remove(&peer_id) else {
            return Vec::new();
        };
        let mut released: Vec<AssignedDownload> = hashes
            .iter()
            .filter_map(|hash| {
                let assigned = self.by_hash.remove(hash)?;
                self.by_height.remove(&(assigned.height(), *hash));
                Some(assigned)
            })
            .collect();
        released.sort_by_key(|assigned| assigned.height());
        released
    }

    /// Remove every assignment older than `max_age`, lowest height first.
    pub fn take_overdue(&mut self, now: Instant, max_age: Duration) -> Vec<AssignedDownload> {
        let overdue: Vec<B256> = self
            .by_height
            .iter()
            .filter_map(|(_, hash)| {
                let assigned = self.by_hash.get(hash)?;
                (now.saturating_duration_since(assigned.assigned_at) >= max_age).then_some(*hash)
            })
            .collect();
        overdue
            .iter()
            .filter_map(|hash| self.remove(hash))
            .collect()
    }

    pub fn lowest_height(&self) -> Option<u64> {
        self.by_height.first().map(|(height, _)| *height)
    }

    pub fn peer_load(&self, peer_id: PeerId) -> usize {
        self.by_peer.get(&peer_id).map_or(0, HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainedHeader;
    use crate::test_utils::build_chain;
    use std::sync::Arc;

    fn assign(table: &mut AssignmentTable, chain: &[Arc<ChainedHeader>], peer: u64, at: Instant) {
        for header in chain {
            assert!(table.insert(AssignedDownload {
                header: header.clone(),
                peer_id: PeerId(peer),
                job_id: 1,
                assigned_at: at,
            }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn indexes_stay_consistent() {
        let chain = build_chain(10, 0);
        let mut table = AssignmentTable::new();
        let now = Instant::now();
        assign(&mut table, &chain[..5], 1, now);
        assign(&mut table, &chain[5..], 2, now);

        assert_eq!(table.len(), 10);
        assert_eq!(table.peer_load(PeerId(1)), 5);
        assert_eq!(table.lowest_height(), Some(0));

        let removed = table.remove(&chain[0].hash()).expect("assigned");
        assert_eq!(removed.peer_id, PeerId(1));
        assert_eq!(table.lowest_height(), Some(1));
        assert_eq!(table.peer_load(PeerId(1)), 4);
        assert!(table.remove(&chain[0].hash()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_insert_is_rejected() {
        let chain = build_chain(1, 0);
        let mut table = AssignmentTable::new();
        assign(&mut table, &chain, 1, Instant::now());
        assert!(!table.insert(AssignedDownload {
            header: chain[0].clone(),
            peer_id: PeerId(2),
            job_id: 2,
            assigned_at: Instant::now(),
        }));
        assert_eq!(table.get(&chain[0].hash()).expect("assigned").peer_id, PeerId(1));
    }

    #[tokio::test(start_paused = true)]
    async fn release_peer_returns_sorted_assignments() {
        let chain = build_chain(20, 0);
        let mut table = AssignmentTable::new();
        let now = Instant::now();
        for (idx, header) in chain.iter().enumerate().rev() {
            table.insert(AssignedDownload {
                header: header.clone(),
                peer_id: PeerId(idx as u64 % 2),
                job_id: 1,
                assigned_at: now,
            });
        }

        let released = table.release_peer(PeerId(1));
        let heights: Vec<u64> = released.iter().map(AssignedDownload::height).collect();
        assert_eq!(heights, vec![1, 3, 5, 7, 9, 11, 13, 15, 17, 19]);
        assert_eq!(table.len(), 10);
        assert_eq!(table.peer_load(PeerId(1)), 0);
        assert!(table.release_peer(PeerId(1)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn take_overdue_only_removes_old_assignments() {
        let chain = build_chain(6, 0);
        let mut table = AssignmentTable::new();
        let start = Instant::now();
        assign(&mut table, &chain[..3], 1, start);
        tokio::time::advance(Duration::from_secs(3)).await;
        assign(&mut table, &chain[3..], 2, Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;

        let overdue = table.take_overdue(Instant::now(), Duration::from_secs(5));
        let heights: Vec<u64> = overdue.iter().map(AssignedDownload::height).collect();
        assert_eq!(heights, vec![0, 1, 2]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.lowest_height(), Some(3));
    }
}
