use crate::chain::ChainedHeader;
use crate::cli::PullerConfig;
use crate::p2p::{PeerDownloadCapability, PeerId};
use alloy_primitives::B256;
use async_trait::async_trait;
use eyre::{eyre, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "block-puller-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

pub fn hash_from_u64(value: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&value.to_be_bytes());
    B256::from(bytes)
}

/// Headers at heights `0..len`; height `n` hashes to `seed + n`.
pub fn build_chain(len: u64, seed: u64) -> Vec<Arc<ChainedHeader>> {
    let mut chain = Vec::with_capacity(len as usize);
    if len == 0 {
        return chain;
    }
    let mut tip = ChainedHeader::genesis(hash_from_u64(seed));
    chain.push(Arc::clone(&tip));
    for n in 1..len {
        tip = ChainedHeader::extend(&tip, hash_from_u64(seed + n));
        chain.push(Arc::clone(&tip));
    }
    chain
}

/// `len` headers built on top of `parent`.
pub fn fork_chain(parent: &Arc<ChainedHeader>, len: u64, seed: u64) -> Vec<Arc<ChainedHeader>> {
    let mut chain = Vec::with_capacity(len as usize);
    let mut tip = Arc::clone(parent);
    for n in 0..len {
        tip = ChainedHeader::extend(&tip, hash_from_u64(seed + n));
        chain.push(Arc::clone(&tip));
    }
    chain
}

/// Puller tuning with a fixed RNG seed.
pub fn test_config() -> PullerConfig {
    PullerConfig {
        rng_seed: Some(42),
        ..PullerConfig::default()
    }
}

/// Capability that records every request it is given.
#[derive(Debug)]
pub struct MockPeer {
    peer_id: PeerId,
    protocol_version: u32,
    serves_blocks: bool,
    fail_requests: AtomicBool,
    requests: Mutex<Vec<Vec<B256>>>,
}

impl MockPeer {
    pub fn new(id: u64) -> Arc<Self> {
        Self::with_capabilities(id, 70015, true)
    }

    pub fn with_capabilities(id: u64, protocol_version: u32, serves_blocks: bool) -> Arc<Self> {
        Arc::new(Self {
            peer_id: PeerId(id),
            protocol_version,
            serves_blocks,
            fail_requests: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(id: u64) -> Arc<Self> {
        let peer = Self::new(id);
        peer.fail_requests.store(true, Ordering::SeqCst);
        peer
    }

    pub fn id(&self) -> PeerId {
        self.peer_id
    }

    pub fn requests(&self) -> Vec<Vec<B256>> {
        self.requests.lock().clone()
    }

    pub fn requested_hashes(&self) -> Vec<B256> {
        self.requests.lock().iter().flatten().copied().collect()
    }
}

#[async_trait]
impl PeerDownloadCapability for MockPeer {
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
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(eyre!("{} refused request", self.peer_id));
        }
        self.requests.lock().push(hashes);
        Ok(())
    }
}

/// Yield to the runtime until `check` holds or the attempts run out.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if check() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    check()
}
