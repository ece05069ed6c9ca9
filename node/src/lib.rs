//! Multi-peer block download scheduling.

pub mod chain;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod p2p;
pub mod puller;

#[cfg(test)]
mod test_utils;

pub use chain::{ChainedHeader, IbdStatus};
pub use cli::{LogConfig, PullerConfig};
pub use p2p::{ChannelPeer, PeerDownloadCapability, PeerId};
pub use puller::{BlockDownloaded, BlockPuller, DownloadOutcome, PullerStats, PullerTasks};
