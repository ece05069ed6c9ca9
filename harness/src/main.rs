use alloy_primitives::{keccak256, Bytes, B256};
use block_puller::chain::ChainedHeader;
use block_puller::cli::{LogConfig, PullerConfig};
use block_puller::logging::init_tracing;
use block_puller::metrics::{percent, rate_per_sec};
use block_puller::p2p::{BlockRequest, ChannelPeer, PeerId};
use block_puller::puller::{BlockDownloaded, BlockPuller, DownloadOutcome, PeerQualityDump, PullerStats};
use clap::Parser;
use eyre::{ensure, Result, WrapErr};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: u32 = 70015;
const MAIN_BRANCH: u64 = 0;
const FORK_BRANCH: u64 = 1;

/// Drive the block puller against a simulated swarm.
#[derive(Parser, Debug)]
#[command(name = "block-puller-harness", about)]
struct HarnessArgs {
    /// Length of the main chain to download.
    #[arg(long, default_value_t = 2_000)]
    blocks: u64,
    /// Height at which odd-numbered peers switch to a competing branch.
    #[arg(long)]
    fork_at: Option<u64>,
    #[arg(long, default_value_t = 8)]
    peers: usize,
    /// Slowest peer bandwidth (bytes/sec).
    #[arg(long, default_value_t = 256 * 1024)]
    min_bandwidth: u64,
    /// Fastest peer bandwidth (bytes/sec).
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    max_bandwidth: u64,
    /// Chance that a peer silently drops a requested block.
    #[arg(long, default_value_t = 0.01)]
    stall_probability: f64,
    /// Disconnect the first peer after it delivers this many blocks.
    #[arg(long)]
    disconnect_after: Option<u64>,
    /// Headers per download request.
    #[arg(long, default_value_t = 500)]
    request_batch: usize,
    /// Size of every simulated block.
    #[arg(long, default_value_t = 16 * 1024)]
    block_size: usize,
    /// Start the puller in initial block download mode.
    #[arg(long)]
    ibd: bool,
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
    /// Also write the JSON summary to this file.
    #[arg(long)]
    output: Option<PathBuf>,
    #[command(flatten)]
    puller: PullerConfig,
    #[command(flatten)]
    log: LogConfig,
}

impl HarnessArgs {
    fn validate(&self) -> Result<()> {
        ensure!(self.blocks > 0, "--blocks must be positive");
        ensure!(self.peers > 0, "--peers must be positive");
        ensure!(self.request_batch > 0, "--request-batch must be positive");
        ensure!(self.min_bandwidth > 0, "--min-bandwidth must be positive");
        ensure!(
            self.min_bandwidth <= self.max_bandwidth,
            "--min-bandwidth {} exceeds --max-bandwidth {}",
            self.min_bandwidth,
            self.max_bandwidth
        );
        ensure!(
            (0.0..1.0).contains(&self.stall_probability),
            "--stall-probability must be within [0, 1), got {}",
            self.stall_probability
        );
        if let Some(fork_at) = self.fork_at {
            ensure!(
                fork_at + 1 < self.blocks,
                "--fork-at {fork_at} must be below the chain tip {}",
                self.blocks - 1
            );
        }
        Ok(())
    }

    fn bandwidth_for(&self, index: usize) -> u64 {
        if self.peers == 1 {
            return self.max_bandwidth;
        }
        let spread = self.max_bandwidth - self.min_bandwidth;
        self.min_bandwidth + spread * index as u64 / (self.peers as u64 - 1)
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerProfile {
    peer_id: PeerId,
    bandwidth: u64,
    stall_probability: f64,
    disconnect_after: Option<u64>,
    block_size: usize,
}

#[derive(Debug, Clone, Serialize)]
struct SessionReport {
    peer_id: PeerId,
    bandwidth: u64,
    on_fork: bool,
    requested: u64,
    delivered: u64,
    dropped: u64,
    disconnected: bool,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    blocks_requested: u64,
    delivered: u64,
    failed: u64,
    duplicates: u64,
    unresolved: u64,
    delivered_pct: Option<f64>,
    bytes_delivered: u64,
    elapsed_secs: f64,
    blocks_per_sec: Option<f64>,
    timed_out: bool,
    sessions: Vec<SessionReport>,
    quality: Vec<PeerQualityDump>,
    stats: PullerStats,
}

fn header_hash(branch: u64, height: u64) -> B256 {
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&branch.to_be_bytes());
    seed[8..].copy_from_slice(&height.to_be_bytes());
    keccak256(seed)
}

fn build_branch(parent: Option<&Arc<ChainedHeader>>, branch: u64, tip_height: u64) -> Vec<Arc<ChainedHeader>> {
    let mut headers = Vec::new();
    let mut tip = match parent {
        Some(parent) => Arc::clone(parent),
        None => {
            let genesis = ChainedHeader::genesis(header_hash(branch, 0));
            headers.push(Arc::clone(&genesis));
            genesis
        }
    };
    while tip.height() < tip_height {
        tip = ChainedHeader::extend(&tip, header_hash(branch, tip.height() + 1));
        headers.push(Arc::clone(&tip));
    }
    headers
}

/// Serve requests for one simulated peer until stopped or disconnected.
async fn run_session(
    profile: PeerProfile,
    on_fork: bool,
    mut requests: mpsc::UnboundedReceiver<BlockRequest>,
    puller: BlockPuller,
    mut stop: watch::Receiver<bool>,
    mut rng: StdRng,
) -> SessionReport {
    let mut report = SessionReport {
        peer_id: profile.peer_id,
        bandwidth: profile.bandwidth,
        on_fork,
        requested: 0,
        delivered: 0,
        dropped: 0,
        disconnected: false,
    };
    let per_block = Duration::from_secs_f64(profile.block_size as f64 / profile.bandwidth as f64);
    let payload = Bytes::from(vec![0u8; profile.block_size]);

    loop {
        let request = tokio::select! {
            request = requests.recv() => request,
            _ = stop.changed() => None,
        };
        let Some(request) = request else {
            break;
        };
        report.requested += request.hashes.len() as u64;
        for hash in request.hashes {
            if rng.gen_bool(profile.stall_probability) {
                report.dropped += 1;
                continue;
            }
            tokio::time::sleep(per_block).await;
            puller.push_block(hash, payload.clone(), profile.peer_id);
            report.delivered += 1;
            if profile.disconnect_after == Some(report.delivered) {
                info!(peer_id = %profile.peer_id, delivered = report.delivered, "simulated disconnect");
                puller.peer_disconnected(profile.peer_id);
                report.disconnected = true;
                return report;
            }
        }
    }
    report
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = HarnessArgs::parse();
    let guards = init_tracing(&args.log)?;
    let result = run(args).await;
    if let Err(err) = &result {
        warn!(error = %err, "harness run failed");
    }
    guards.finish();
    result
}

async fn run(args: HarnessArgs) -> Result<()> {
    args.validate()?;
    let mut rng = match args.puller.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_entropy(),
    };

    let main_chain = build_branch(None, MAIN_BRANCH, args.blocks - 1);
    let fork_tip = match args.fork_at {
        Some(fork_at) => {
            let fork_point = &main_chain[fork_at as usize];
            let fork_tip = build_branch(Some(fork_point), FORK_BRANCH, args.blocks - 1).pop();
            if let (Some(fork_tip), Some(main_tip)) = (fork_tip.as_ref(), main_chain.last()) {
                if let Some(shared) = ChainedHeader::find_fork(fork_tip, main_tip) {
                    info!(fork_height = shared.height(), fork_hash = %shared.hash(), "built competing branch");
                }
            }
            fork_tip
        }
        None => None,
    };

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<BlockDownloaded>();
    let puller = BlockPuller::new(args.puller.clone(), outcome_tx)?;
    if args.ibd {
        puller.on_ibd_state_changed(true);
    }
    let tasks = puller.start();

    let (stop_tx, stop_rx) = watch::channel(false);
    let main_tip = main_chain
        .last()
        .cloned()
        .ok_or_else(|| eyre::eyre!("main chain is empty"))?;
    let mut sessions = Vec::with_capacity(args.peers);
    for index in 0..args.peers {
        let profile = PeerProfile {
            peer_id: PeerId(index as u64 + 1),
            bandwidth: args.bandwidth_for(index),
            stall_probability: args.stall_probability,
            disconnect_after: if index == 0 { args.disconnect_after } else { None },
            block_size: args.block_size,
        };
        let (peer, requests) = ChannelPeer::new(profile.peer_id, PROTOCOL_VERSION, true);
        let tip = match (&fork_tip, index % 2 == 1) {
            (Some(fork_tip), true) => Arc::clone(fork_tip),
            _ => Arc::clone(&main_tip),
        };
        let on_fork = fork_tip.is_some() && index % 2 == 1;
        debug!(peer_id = %profile.peer_id, bandwidth = profile.bandwidth, on_fork, "spawning simulated peer");
        puller.new_peer_tip_claimed(Arc::new(peer), tip);
        sessions.push(tokio::spawn(run_session(
            profile,
            on_fork,
            requests,
            puller.clone(),
            stop_rx.clone(),
            StdRng::seed_from_u64(rng.gen()),
        )));
    }

    let started = Instant::now();
    for chunk in main_chain.chunks(args.request_batch) {
        puller.request_blocks_download(chunk.to_vec());
    }
    info!(
        blocks = args.blocks,
        peers = args.peers,
        batches = main_chain.len().div_ceil(args.request_batch),
        "download requested"
    );

    let total = main_chain.len() as u64;
    let mut seen: HashMap<B256, DownloadOutcome> = HashMap::with_capacity(main_chain.len());
    let mut duplicates = 0u64;
    let mut bytes_delivered = 0u64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let mut timed_out = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    while (seen.len() as u64) < total {
        tokio::select! {
            outcome = outcome_rx.recv() => {
                let Some(outcome) = outcome else {
                    break;
                };
                if let DownloadOutcome::Delivered { block, .. } = &outcome.outcome {
                    bytes_delivered += block.len() as u64;
                }
                if seen.insert(outcome.hash, outcome.outcome).is_some() {
                    duplicates += 1;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                warn!(resolved = seen.len(), total, "timed out waiting for downloads");
                break;
            }
            _ = &mut ctrl_c => {
                warn!(resolved = seen.len(), total, "interrupted");
                break;
            }
        }
    }
    let elapsed = started.elapsed();

    let stats = puller.stats();
    let quality = puller.peer_quality_snapshot();
    puller.shutdown();
    stop_tx.send_replace(true);
    tasks.join().await?;
    let sessions: Vec<SessionReport> = join_all(sessions)
        .await
        .into_iter()
        .collect::<std::result::Result<_, _>>()
        .wrap_err("peer session panicked")?;

    let delivered = seen
        .values()
        .filter(|outcome| matches!(outcome, DownloadOutcome::Delivered { .. }))
        .count() as u64;
    let failed = seen.len() as u64 - delivered;
    let summary = RunSummary {
        blocks_requested: total,
        delivered,
        failed,
        duplicates,
        unresolved: total - seen.len() as u64,
        delivered_pct: percent(delivered, total),
        bytes_delivered,
        elapsed_secs: elapsed.as_secs_f64(),
        blocks_per_sec: rate_per_sec(delivered, elapsed),
        timed_out,
        sessions,
        quality,
        stats,
    };
    info!(
        delivered,
        failed,
        duplicates,
        elapsed_ms = elapsed.as_millis() as u64,
        "harness run complete"
    );

    let json = serde_json::to_string_pretty(&summary).wrap_err("failed to encode summary")?;
    println!("{json}");
    if let Some(path) = args.output.as_ref() {
        std::fs::write(path, &json)
            .wrap_err_with(|| format!("failed to write summary to {}", path.display()))?;
    }
    Ok(())
}
