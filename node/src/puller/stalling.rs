//! Overdue assignment detection.

use super::assignments::AssignmentTable;
use super::types::AssignedDownload;
use crate::p2p::PeerId;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Penalty owed by one peer for the blocks it failed to deliver in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallPenalty {
    pub peer_id: PeerId,
    pub overdue: usize,
    /// Overdue blocks close enough to the lowest assigned height to hold up progress.
    pub important: u32,
}

#[derive(Debug, Default)]
pub struct StallReport {
    /// Released assignments, lowest height first.
    pub released: Vec<AssignedDownload>,
    pub penalties: Vec<StallPenalty>,
}

impl StallReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty()
    }
}

/// Pull every overdue assignment out of `table` and work out who pays for it.
///
/// The important window is measured from the lowest assigned height before
/// anything is released.
pub fn collect_stalled(
    table: &mut AssignmentTable,
    now: Instant,
    max_time_to_deliver: Duration,
    important_height_margin: u64,
) -> StallReport {
    let lowest_height = table.lowest_height();
    let released = table.take_overdue(now, max_time_to_deliver);
    let penalties = stall_penalties(&released, lowest_height, important_height_margin);
    StallReport {
        released,
        penalties,
    }
}

pub fn stall_penalties(
    overdue: &[AssignedDownload],
    lowest_height: Option<u64>,
    important_height_margin: u64,
) -> Vec<StallPenalty> {
    let important_ceiling = lowest_height.map(|height| height.saturating_add(important_height_margin));
    let mut per_peer: BTreeMap<PeerId, StallPenalty> = BTreeMap::new();
    for assigned in overdue {
        let entry = per_peer.entry(assigned.peer_id).or_insert(StallPenalty {
            peer_id: assigned.peer_id,
            overdue: 0,
            important: 0,
        });
        entry.overdue += 1;
        if important_ceiling.is_some_and(|ceiling| assigned.height() <= ceiling) {
            entry.important += 1;
        }
    }
    per_peer.into_values().collect()
}
