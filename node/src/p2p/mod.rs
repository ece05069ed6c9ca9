//! Peer-facing seams of the puller.
//!
//! The puller never talks to a transport directly. Each connected peer is
//! represented by a [`PeerDownloadCapability`] that knows how to put a block
//! request on the wire; delivered blocks come back through
//! [`crate::puller::BlockPuller::push_block`].

use alloy_primitives::B256;
use async_trait::async_trait;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Connection identifier of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Block download capability of a single connected peer.
#[async_trait]
pub trait PeerDownloadCapability: Send + Sync {
    fn peer_id(&self) -> PeerId;

    /// Negotiated protocol version.
    fn protocol_version(&self) -> u32;

    /// Whether the peer advertised that it serves full blocks.
    fn can_serve_blocks(&self) -> bool;

    /// Ask the peer for the given blocks. Delivery happens out of band.
    async fn request_blocks(&self, hashes: Vec<B256>) -> Result<()>;
}

/// Minimum capabilities a peer needs before it is used for downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRequirement {
    pub min_protocol_version: u32,
}

impl PeerRequirement {
    pub fn new(min_protocol_version: u32) -> Self {
        Self {
            min_protocol_version,
        }
    }

    /// Returns the reason the peer is rejected, if any.
    pub fn check(&self, peer: &dyn PeerDownloadCapability) -> std::result::Result<(), String> {
        if peer.protocol_version() < self.min_protocol_version {
            return Err(format!(
                "protocol version {} below required {}",
                peer.protocol_version(),
                self.min_protocol_version
            ));
        }
        if !peer.can_serve_blocks() {
            return Err("peer does not serve blocks".to_string());
        }
        Ok(())
    }
}

/// A block request forwarded to a peer's session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub peer_id: PeerId,
    pub hashes: Vec<B256>,
}

/// Capability backed by a channel into the peer's session task.
///
/// Requests fail once the session task drops its receiver, which the puller
/// treats the same as a disconnect.
#[derive(Debug, Clone)]
pub struct ChannelPeer {
    peer_id: PeerId,
    protocol_version: u32,
    serves_blocks: bool,
    requests: mpsc::UnboundedSender<BlockRequest>,
}

impl ChannelPeer {
    pub fn new(
        peer_id: PeerId,
        protocol_version: u32,
        serves_blocks: bool,
    ) -> (Self, mpsc::UnboundedReceiver<BlockRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (
            Self {
                peer_id,
                protocol_version,
                serves_blocks,
                requests,
            },
            rx,
        )
    }
}

#[async_trait]
impl PeerDownloadCapability for ChannelPeer {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    fn can_serve_blocks(&self) -> bool {
        self.serves_blocks
    }

    async fn request_blocks(&self, hashes: Vec<B256>) -> Result<()> {
        self.requests
            .send(BlockRequest {
                peer_id: self.peer_id,
                hashes,
            })
            .map_err(|_| eyre!("session for {} is closed", self.peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirement_rejects_old_or_non_serving_peers() {
        let requirement = PeerRequirement::new(70012);
        let (old, _rx_old) = ChannelPeer::new(PeerId(1), 70001, true);
        let (pruned, _rx_pruned) = ChannelPeer::new(PeerId(2), 70015, false);
        let (good, _rx_good) = ChannelPeer::new(PeerId(3), 70015, true);

        assert!(requirement.check(&old).is_err());
        assert!(requirement.check(&pruned).is_err());
        assert!(requirement.check(&good).is_ok());
    }

    #[tokio::test]
    async fn channel_peer_forwards_requests() {
        let (peer, mut rx) = ChannelPeer::new(PeerId(7), 70015, true);
        let hashes = vec![B256::from([0x01u8; 32]), B256::from([0x02u8; 32])];
        peer.request_blocks(hashes.clone()).await.expect("send");

        let request = rx.recv().await.expect("request");
        assert_eq!(request.peer_id, PeerId(7));
        assert_eq!(request.hashes, hashes);
    }

    #[tokio::test]
    async fn channel_peer_fails_after_session_closes() {
        let (peer, rx) = ChannelPeer::new(PeerId(9), 70015, true);
        drop(rx);
        assert!(peer.request_blocks(vec![B256::ZERO]).await.is_err());
    }

    #[test]
    fn peer_id_display() {
        assert_eq!(PeerId(42).to_string(), "peer-42");
    }
}
