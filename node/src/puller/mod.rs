//! Multi-peer block download scheduler.
//!
//! Callers hand in ordered header chains; the puller spreads them across the
//! peers that claim them, weighted by each peer's observed throughput, and
//! reports exactly one [`BlockDownloaded`] per requested header on the outcome
//! channel. Undelivered blocks are pulled back and handed to someone else,
//! either when their peer disconnects or when the stalling loop finds them
//! overdue.

mod assignments;
mod distributor;
mod quality;
mod stalling;
mod stats;
mod types;

pub use assignments::AssignmentTable;
pub use distributor::{
    distribute_headers, pick_weighted, take_unclaimed, Distribution, PeerCandidate,
};
pub use quality::{PeerQualityTracker, QualityConfig};
pub use stalling::{collect_stalled, stall_penalties, StallPenalty, StallReport};
pub use stats::{CounterSnapshot, PeerQualityDump, PullerCounters, PullerStats, RollingAverage};
pub use types::{AssignedDownload, BlockDownloaded, DownloadJob, DownloadOutcome, JobId};

use crate::chain::{ChainedHeader, IbdStatus};
use crate::cli::PullerConfig;
use crate::p2p::{PeerDownloadCapability, PeerId, PeerRequirement};
use alloy_primitives::{Bytes, B256};
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

const MIN_DELIVERY_TIME: Duration = Duration::from_millis(1);

struct PeerRecord {
    capability: Arc<dyn PeerDownloadCapability>,
    tip: Arc<ChainedHeader>,
    quality: PeerQualityTracker,
}

struct PullerState {
    peers: HashMap<PeerId, PeerRecord>,
    assignments: AssignmentTable,
    jobs: VecDeque<DownloadJob>,
    reassignment: VecDeque<DownloadJob>,
    /// Hashes requested and not yet resolved, assigned or queued.
    outstanding: HashSet<B256>,
    rng: StdRng,
    is_ibd: bool,
    max_in_flight: usize,
    average_block_size: RollingAverage,
    next_job_id: JobId,
}

impl PullerState {
    fn next_job_id(&mut self) -> JobId {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    fn best_speed(&self) -> u64 {
        self.peers
            .values()
            .map(|peer| peer.quality.scoring_speed())
            .max()
            .unwrap_or(0)
    }

    fn total_speed(&self) -> u64 {
        self.peers
            .values()
            .map(|peer| peer.quality.speed())
            .fold(0u64, u64::saturating_add)
    }

    fn recalculate_all_scores(&mut self) {
        let best = self.best_speed();
        for peer in self.peers.values_mut() {
            peer.quality.recalculate_quality_score(best);
        }
    }

    fn recalculate_max_in_flight(&mut self, config: &PullerConfig) {
        let average = self.average_block_size.average();
        let floor = config.min_blocks_being_downloaded;
        self.max_in_flight = if average == 0 {
            floor
        } else {
            let blocks = self.total_speed() as f64 / average as f64 * config.download_buffer_secs;
            (blocks as usize).max(floor)
        };
    }

    fn candidates(&self) -> Vec<PeerCandidate> {
        let mut candidates: Vec<PeerCandidate> = self
            .peers
            .iter()
            .map(|(peer_id, peer)| PeerCandidate {
                peer_id: *peer_id,
                tip: Arc::clone(&peer.tip),
                score: peer.quality.score(),
            })
            .collect();
        candidates.sort_by_key(|candidate| candidate.peer_id);
        candidates
    }

    fn queued_headers(&self) -> usize {
        self.jobs.iter().map(DownloadJob::len).sum()
    }

    fn reassignment_headers(&self) -> usize {
        self.reassignment.iter().map(DownloadJob::len).sum()
    }

    /// Queue released assignments for another peer, keeping height order.
    fn requeue(&mut self, released: Vec<AssignedDownload>) -> usize {
        let count = released.len();
        if count == 0 {
            return 0;
        }
        let job_id = self.next_job_id();
        self.reassignment.push_back(DownloadJob::new(
            job_id,
            released.into_iter().map(|assigned| assigned.header),
        ));
        count
    }
}

/// Drain jobs from the front of `queue` into `distribution` until `slots` run out.
fn drain_queue(
    queue: &mut VecDeque<DownloadJob>,
    candidates: &[PeerCandidate],
    slots: &mut usize,
    now: Instant,
    rng: &mut StdRng,
    distribution: &mut Distribution,
) {
    while *slots > 0 {
        let Some(job) = queue.front_mut() else {
            break;
        };
        let pass = distribute_headers(job, candidates, *slots, now, rng);
        *slots -= pass.assigned.len();
        distribution.assigned.extend(pass.assigned);
        distribution.failed.extend(pass.failed);
        if job.is_empty() {
            queue.pop_front();
        }
    }
}

struct PeerDispatch {
    peer_id: PeerId,
    capability: Arc<dyn PeerDownloadCapability>,
    hashes: Vec<B256>,
}

struct PullerInner {
    config: PullerConfig,
    quality: QualityConfig,
    requirement: PeerRequirement,
    state: Mutex<PullerState>,
    sink: mpsc::UnboundedSender<BlockDownloaded>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    counters: PullerCounters,
    ibd_status: Option<Arc<dyn IbdStatus>>,
}

/// Handle to the block puller. Cheap to clone.
#[derive(Clone)]
pub struct BlockPuller {
    inner: Arc<PullerInner>,
}

/// Background tasks started by [`BlockPuller::start`].
pub struct PullerTasks {
    handles: Vec<JoinHandle<()>>,
}

impl PullerTasks {
    /// Wait for every loop to exit.
    pub async fn join(self) -> Result<()> {
        for handle in self.handles {
            handle.await.wrap_err("puller task panicked")?;
        }
        Ok(())
    }
}

impl BlockPuller {
    pub fn new(config: PullerConfig, sink: mpsc::UnboundedSender<BlockDownloaded>) -> Result<Self> {
        Self::build(config, sink, None)
    }

    /// Create a puller that polls `ibd_status` on every stalling tick.
    pub fn new_with_ibd_status(
        config: PullerConfig,
        sink: mpsc::UnboundedSender<BlockDownloaded>,
        ibd_status: Arc<dyn IbdStatus>,
    ) -> Result<Self> {
        Self::build(config, sink, Some(ibd_status))
    }

    fn build(
        config: PullerConfig,
        sink: mpsc::UnboundedSender<BlockDownloaded>,
        ibd_status: Option<Arc<dyn IbdStatus>>,
    ) -> Result<Self> {
        config.validate().wrap_err("invalid puller config")?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let is_ibd = ibd_status
            .as_ref()
            .map(|status| status.is_initial_block_download())
            .unwrap_or(false);
        let state = PullerState {
            peers: HashMap::new(),
            assignments: AssignmentTable::new(),
            jobs: VecDeque::new(),
            reassignment: VecDeque::new(),
            outstanding: HashSet::new(),
            rng,
            is_ibd,
            max_in_flight: config.min_blocks_being_downloaded,
            average_block_size: RollingAverage::new(config.average_block_size_samples),
            next_job_id: 1,
        };
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(PullerInner {
                quality: QualityConfig::from_puller_config(&config),
                requirement: PeerRequirement::new(config.min_protocol_version),
                config,
                state: Mutex::new(state),
                sink,
                wake: Notify::new(),
                shutdown,
                counters: PullerCounters::default(),
                ibd_status,
            }),
        })
    }

    /// Spawn the assignment, stalling and (if enabled) stats loops.
    pub fn start(&self) -> PullerTasks {
        let mut handles = Vec::with_capacity(3);
        let puller = self.clone();
        handles.push(tokio::spawn(async move { puller.assignment_loop().await }));
        let puller = self.clone();
        handles.push(tokio::spawn(async move { puller.stalling_loop().await }));
        if let Some(interval) = self.inner.config.stats_interval() {
            let puller = self.clone();
            handles.push(tokio::spawn(async move { puller.stats_loop(interval).await }));
        }
        info!(
            stalling_interval_ms = self.inner.config.stalling_loop_interval_ms,
            max_seconds_to_deliver = self.inner.config.max_seconds_to_deliver_block,
            "block puller started"
        );
        PullerTasks { handles }
    }

    /// Stop the background loops. Outstanding assignments are abandoned.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            info!("block puller shutting down");
        }
        self.inner.wake.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Queue headers for download.
    ///
    /// Headers already outstanding from an earlier request are skipped; their
    /// single outcome covers both requests.
    pub fn request_blocks_download(&self, headers: Vec<Arc<ChainedHeader>>) -> JobId {
        let requested = headers.len();
        let (job_id, queued) = {
            let mut state = self.inner.state.lock();
            let job_id = state.next_job_id();
            let mut fresh: Vec<Arc<ChainedHeader>> = headers
                .into_iter()
                .filter(|header| state.outstanding.insert(header.hash()))
                .collect();
            fresh.sort_by_key(|header| header.height());
            let queued = fresh.len();
            if queued > 0 {
                state.jobs.push_back(DownloadJob::new(job_id, fresh));
            }
            (job_id, queued)
        };
        debug!(
            job_id,
            requested,
            queued,
            duplicates = requested - queued,
            "queued block download job"
        );
        if queued > 0 {
            self.inner.wake.notify_one();
        }
        job_id
    }

    /// Register a peer or update the tip of a known one.
    pub fn new_peer_tip_claimed(
        &self,
        peer: Arc<dyn PeerDownloadCapability>,
        tip: Arc<ChainedHeader>,
    ) {
        let peer_id = peer.peer_id();
        let tip_height = tip.height();
        {
            let mut state = self.inner.state.lock();
            if let Some(record) = state.peers.get_mut(&peer_id) {
                record.tip = tip;
                trace!(peer_id = %peer_id, tip_height, "peer tip updated");
            } else {
                if let Err(reason) = self.inner.requirement.check(peer.as_ref()) {
                    debug!(peer_id = %peer_id, %reason, "ignoring peer that cannot serve blocks");
                    return;
                }
                let is_ibd = state.is_ibd;
                let best = state.best_speed();
                let mut quality = PeerQualityTracker::new(self.inner.quality, is_ibd);
                quality.recalculate_quality_score(best);
                state.peers.insert(
                    peer_id,
                    PeerRecord {
                        capability: peer,
                        tip,
                        quality,
                    },
                );
                debug!(peer_id = %peer_id, tip_height, peers = state.peers.len(), "peer added");
            }
        }
        self.inner.wake.notify_one();
    }

    /// Drop a peer and queue its assignments for reassignment.
    pub fn peer_disconnected(&self, peer_id: PeerId) {
        let released = {
            let mut state = self.inner.state.lock();
            if state.peers.remove(&peer_id).is_none() {
                return;
            }
            let released = state.assignments.release_peer(peer_id);
            let released = state.requeue(released);
            state.recalculate_all_scores();
            released
        };
        self.inner.counters.record_reassigned(released as u64);
        debug!(peer_id = %peer_id, released, "peer removed");
        self.inner.wake.notify_one();
    }

    /// Accept a block from `peer_id`.
    ///
    /// Ignored unless the hash is currently assigned to that peer.
    pub fn push_block(&self, hash: B256, block: Bytes, peer_id: PeerId) {
        let now = Instant::now();
        let outcome = {
            let mut state = self.inner.state.lock();
            let owner = state.assignments.get(&hash).map(|assigned| assigned.peer_id);
            if owner != Some(peer_id) {
                drop(state);
                self.inner.counters.record_ignored_delivery();
                trace!(%hash, peer_id = %peer_id, owner = ?owner, "ignoring unexpected block");
                return;
            }
            let Some(assigned) = state.assignments.remove(&hash) else {
                return;
            };
            state.outstanding.remove(&hash);

            let size = block.len() as u64;
            let elapsed = now
                .saturating_duration_since(assigned.assigned_at)
                .max(MIN_DELIVERY_TIME);
            let best_before = state.best_speed();
            let mut rescore_all = false;
            if let Some(record) = state.peers.get_mut(&peer_id) {
                let was_best = record.quality.scoring_speed() >= best_before;
                record.quality.add_sample(size, elapsed.as_secs_f64());
                rescore_all = was_best || record.quality.scoring_speed() >= best_before;
            }
            if rescore_all {
                state.recalculate_all_scores();
            } else {
                let best = state.best_speed();
                if let Some(record) = state.peers.get_mut(&peer_id) {
                    record.quality.recalculate_quality_score(best);
                }
            }
            state.average_block_size.push(size);
            state.recalculate_max_in_flight(&self.inner.config);
            trace!(
                %hash,
                peer_id = %peer_id,
                size,
                elapsed_ms = elapsed.as_millis() as u64,
                max_in_flight = state.max_in_flight,
                "block delivered"
            );
            BlockDownloaded::delivered(hash, block, peer_id)
        };
        self.inner.counters.record_delivered();
        self.emit(outcome);
        self.inner.wake.notify_one();
    }

    pub fn on_ibd_state_changed(&self, is_ibd: bool) {
        {
            let mut state = self.inner.state.lock();
            state.is_ibd = is_ibd;
            for peer in state.peers.values_mut() {
                peer.quality.on_ibd_state_changed(is_ibd);
            }
            state.recalculate_all_scores();
        }
        info!(is_ibd, "initial block download state changed");
    }

    /// Override the in-flight cap until the next delivery recalculates it.
    pub fn set_max_blocks_being_downloaded(&self, max: usize) {
        self.inner.state.lock().max_in_flight = max;
        debug!(max, "max blocks being downloaded overridden");
        self.inner.wake.notify_one();
    }

    /// Run one assignment pass. Returns the number of headers assigned.
    ///
    /// Requests are dispatched on spawned tasks, so this must be called from
    /// within a tokio runtime.
    pub fn assign_download_jobs(&self) -> usize {
        if self.is_shutdown() {
            return 0;
        }
        let now = Instant::now();
        let (failed, dispatches, assigned) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let mut slots = state.max_in_flight.saturating_sub(state.assignments.len());
            if state.jobs.is_empty() && state.reassignment.is_empty() {
                return 0;
            }
            let candidates = state.candidates();
            let mut distribution = Distribution::default();
            if slots == 0 {
                // Nothing can be assigned, but headers nobody claims still fail now.
                distribution
                    .failed
                    .extend(take_unclaimed(&mut state.reassignment, &candidates));
                distribution
                    .failed
                    .extend(take_unclaimed(&mut state.jobs, &candidates));
            }
            drain_queue(
                &mut state.reassignment,
                &candidates,
                &mut slots,
                now,
                &mut state.rng,
                &mut distribution,
            );
            drain_queue(
                &mut state.jobs,
                &candidates,
                &mut slots,
                now,
                &mut state.rng,
                &mut distribution,
            );

            let mut failed = Vec::with_capacity(distribution.failed.len());
            for header in distribution.failed {
                let hash = header.hash();
                state.outstanding.remove(&hash);
                failed.push(BlockDownloaded::failed(hash));
            }

            let assigned = distribution.assigned.len();
            let mut per_peer: BTreeMap<PeerId, Vec<B256>> = BTreeMap::new();
            for download in distribution.assigned {
                let peer_id = download.peer_id;
                let hash = download.hash();
                if state.assignments.insert(download) {
                    per_peer.entry(peer_id).or_default().push(hash);
                }
            }
            let dispatches: Vec<PeerDispatch> = per_peer
                .into_iter()
                .filter_map(|(peer_id, hashes)| {
                    let capability = Arc::clone(&state.peers.get(&peer_id)?.capability);
                    Some(PeerDispatch {
                        peer_id,
                        capability,
                        hashes,
                    })
                })
                .collect();
            (failed, dispatches, assigned)
        };

        if !failed.is_empty() {
            self.inner.counters.record_failed(failed.len() as u64);
            debug!(failed = failed.len(), "no peer claims headers");
            for outcome in failed {
                self.emit(outcome);
            }
        }
        for dispatch in dispatches {
            self.dispatch(dispatch);
        }
        assigned
    }

    fn dispatch(&self, dispatch: PeerDispatch) {
        let PeerDispatch {
            peer_id,
            capability,
            hashes,
        } = dispatch;
        debug!(peer_id = %peer_id, blocks = hashes.len(), "requesting blocks");
        let puller = self.clone();
        tokio::spawn(async move {
            if let Err(err) = capability.request_blocks(hashes).await {
                warn!(peer_id = %peer_id, error = %err, "block request failed; dropping peer");
                puller.inner.counters.record_request_failure();
                puller.peer_disconnected(peer_id);
            }
        });
    }

    /// Release overdue assignments and penalize their peers. Returns the
    /// number of released headers.
    pub fn check_stalling(&self) -> usize {
        if let Some(status) = self.inner.ibd_status.as_ref() {
            let is_ibd = status.is_initial_block_download();
            if is_ibd != self.inner.state.lock().is_ibd {
                self.on_ibd_state_changed(is_ibd);
            }
        }

        let config = &self.inner.config;
        let report = {
            let mut state = self.inner.state.lock();
            let report = collect_stalled(
                &mut state.assignments,
                Instant::now(),
                config.max_time_to_deliver_block(),
                config.important_height_margin,
            );
            if report.is_empty() {
                return 0;
            }
            for penalty in &report.penalties {
                if let Some(peer) = state.peers.get_mut(&penalty.peer_id) {
                    peer.quality
                        .penalize(config.max_seconds_to_deliver_block as f64, penalty.important);
                }
            }
            state.recalculate_all_scores();
            state.requeue(report.released.clone());
            report
        };

        let released = report.released.len();
        for penalty in &report.penalties {
            warn!(
                peer_id = %penalty.peer_id,
                overdue = penalty.overdue,
                important = penalty.important,
                "peer stalled block downloads"
            );
        }
        self.inner.counters.record_stalled(released as u64);
        self.inner.counters.record_reassigned(released as u64);
        self.inner.wake.notify_one();
        released
    }

    pub fn stats(&self) -> PullerStats {
        let state = self.inner.state.lock();
        PullerStats {
            peers: state.peers.len(),
            in_flight: state.assignments.len(),
            max_in_flight: state.max_in_flight,
            queued_jobs: state.jobs.len(),
            queued_headers: state.queued_headers(),
            reassignment_jobs: state.reassignment.len(),
            reassignment_headers: state.reassignment_headers(),
            outstanding: state.outstanding.len(),
            average_block_size: state.average_block_size.average(),
            total_speed_bytes_per_sec: state.total_speed(),
            is_ibd: state.is_ibd,
            counters: self.inner.counters.snapshot(),
        }
    }

    /// Per-peer quality, best first.
    pub fn peer_quality_snapshot(&self) -> Vec<PeerQualityDump> {
        let state = self.inner.state.lock();
        let mut dumps: Vec<PeerQualityDump> = state
            .peers
            .iter()
            .map(|(peer_id, peer)| PeerQualityDump {
                peer_id: *peer_id,
                score: peer.quality.score(),
                speed_bytes_per_sec: peer.quality.speed(),
                samples: peer.quality.samples(),
                in_flight: state.assignments.peer_load(*peer_id),
                tip_height: peer.tip.height(),
            })
            .collect();
        dumps.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.peer_id.cmp(&b.peer_id)));
        dumps
    }

    pub fn average_block_size(&self) -> u64 {
        self.inner.state.lock().average_block_size.average()
    }

    pub fn total_speed_bytes_per_sec(&self) -> u64 {
        self.inner.state.lock().total_speed()
    }

    fn emit(&self, outcome: BlockDownloaded) {
        if self.inner.sink.send(outcome).is_err() {
            trace!("outcome receiver dropped");
        }
    }

    async fn assignment_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.assign_download_jobs();
            tokio::select! {
                _ = self.inner.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("assignment loop stopped");
    }

    async fn stalling_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.stalling_loop_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_stalling();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("stalling loop stopped");
    }

    async fn stats_loop(self, interval: Duration) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.stats();
                    info!(
                        peers = stats.peers,
                        in_flight = stats.in_flight,
                        max_in_flight = stats.max_in_flight,
                        queued_headers = stats.queued_headers,
                        reassignment_headers = stats.reassignment_headers,
                        avg_block_size = stats.average_block_size,
                        speed_bps = stats.total_speed_bytes_per_sec,
                        delivered = stats.counters.delivered,
                        failed = stats.counters.failed,
                        stalled = stats.counters.stalled,
                        "block puller stats"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
