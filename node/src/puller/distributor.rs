//! Header to peer distribution.
//!
//! Pure: takes a snapshot of the peer table and returns the assignments and
//! failures for one pass. The caller owns locking and I/O.

use super::types::{AssignedDownload, DownloadJob};
use crate::chain::ChainedHeader;
use crate::p2p::PeerId;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

/// A peer as seen by one distribution pass.
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub peer_id: PeerId,
    pub tip: Arc<ChainedHeader>,
    pub score: f64,
}

impl PeerCandidate {
    fn claims(&self, header: &ChainedHeader) -> bool {
        ChainedHeader::contains(&self.tip, header)
    }
}

#[derive(Debug, Default)]
pub struct Distribution {
    pub assigned: Vec<AssignedDownload>,
    /// Headers no candidate claims.
    pub failed: Vec<Arc<ChainedHeader>>,
}

/// Assign headers from the front of `job` until `empty_slots` are used.
///
/// Unclaimed headers are failed without consuming a slot.
pub fn distribute_headers<R: Rng>(
    job: &mut DownloadJob,
    peers: &[PeerCandidate],
    empty_slots: usize,
    now: Instant,
    rng: &mut R,
) -> Distribution {
    let mut distribution = Distribution::default();
    let mut claimants: Vec<&PeerCandidate> = Vec::with_capacity(peers.len());

    while distribution.assigned.len() < empty_slots {
        let Some(header) = job.headers.pop_front() else {
            break;
        };
        claimants.clear();
        claimants.extend(peers.iter().filter(|peer| peer.claims(&header)));

        match pick_weighted(&claimants, &mut *rng) {
            Some(peer) => distribution.assigned.push(AssignedDownload {
                header,
                peer_id: peer.peer_id,
                job_id: job.job_id,
                assigned_at: now,
            }),
            None => distribution.failed.push(header),
        }
    }

    distribution
}

/// Remove queued headers that no candidate claims, dropping emptied jobs.
pub fn take_unclaimed(
    queue: &mut VecDeque<DownloadJob>,
    peers: &[PeerCandidate],
) -> Vec<Arc<ChainedHeader>> {
    let mut unclaimed = Vec::new();
    for job in queue.iter_mut() {
        job.headers.retain(|header| {
            let claimed = peers.iter().any(|peer| peer.claims(header));
            if !claimed {
                unclaimed.push(Arc::clone(header));
            }
            claimed
        });
    }
    queue.retain(|job| !job.is_empty());
    unclaimed
}

/// Pick a candidate with probability proportional to its score.
pub fn pick_weighted<'a, R: Rng>(
    candidates: &[&'a PeerCandidate],
    rng: &mut R,
) -> Option<&'a PeerCandidate> {
    let last = *candidates.last()?;
    let total: f64 = candidates.iter().map(|peer| peer.score.max(0.0)).sum();
    if total <= 0.0 {
        return Some(candidates[rng.gen_range(0..candidates.len())]);
    }

    let roll = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for candidate in candidates {
        cumulative += candidate.score.max(0.0);
        if roll < cumulative {
            return Some(*candidate);
        }
    }
    Some(last)
}
