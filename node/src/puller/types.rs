//! Shared puller types.

use crate::chain::ChainedHeader;
use crate::p2p::PeerId;
use alloy_primitives::{Bytes, B256};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

/// Identifier handed back by `request_blocks_download`.
pub type JobId = u64;

/// Headers still waiting for a peer, consumed from the front.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub job_id: JobId,
    pub headers: VecDeque<Arc<ChainedHeader>>,
}

impl DownloadJob {
    pub fn new(job_id: JobId, headers: impl IntoIterator<Item = Arc<ChainedHeader>>) -> Self {
        Self {
            job_id,
            headers: headers.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }
}

/// A header handed to a peer and not yet delivered.
#[derive(Debug, Clone)]
pub struct AssignedDownload {
    pub header: Arc<ChainedHeader>,
    pub peer_id: PeerId,
    pub job_id: JobId,
    pub assigned_at: Instant,
}

impl AssignedDownload {
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Delivered { block: Bytes, peer_id: PeerId },
    /// No connected peer could serve the header.
    Failed,
}

/// Final outcome for one requested header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDownloaded {
    pub hash: B256,
    pub outcome: DownloadOutcome,
}

impl BlockDownloaded {
    pub fn delivered(hash: B256, block: Bytes, peer_id: PeerId) -> Self {
        Self {
            hash,
            outcome: DownloadOutcome::Delivered { block, peer_id },
        }
    }

    pub fn failed(hash: B256) -> Self {
        Self {
            hash,
            outcome: DownloadOutcome::Failed,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, DownloadOutcome::Delivered { .. })
    }
}
