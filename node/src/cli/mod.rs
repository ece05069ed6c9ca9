//! CLI and config handling.

use clap::{ArgAction, Args};
use eyre::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IBD_SAMPLES_COUNT: usize = 200;
pub const DEFAULT_NORMAL_SAMPLES_COUNT: usize = 10;
pub const DEFAULT_MAX_SAMPLES_PERCENTAGE_TO_PENALIZE: u32 = 10;
pub const DEFAULT_MIN_QUALITY_SCORE: f64 = 0.01;
pub const DEFAULT_MAX_QUALITY_SCORE: f64 = 1.0;
pub const DEFAULT_SAMPLELESS_QUALITY_SCORE: f64 = 0.3;
pub const DEFAULT_PEER_SPEED_LIMIT_WHEN_NOT_IN_IBD: u64 = 1024 * 1024;
pub const DEFAULT_STALLING_LOOP_INTERVAL_MS: u64 = 500;
pub const DEFAULT_MAX_SECONDS_TO_DELIVER_BLOCK: u64 = 5;
pub const DEFAULT_IMPORTANT_HEIGHT_MARGIN: u64 = 10;
pub const DEFAULT_MIN_BLOCKS_BEING_DOWNLOADED: usize = 10;
pub const DEFAULT_AVERAGE_BLOCK_SIZE_SAMPLES: usize = 1000;
pub const DEFAULT_DOWNLOAD_BUFFER_SECS: f64 = 1.0;
pub const DEFAULT_MIN_PROTOCOL_VERSION: u32 = 70012;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 0;
pub const DEFAULT_LOG_JSON_FILTER: &str = "debug";

/// Block puller tuning.
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
pub struct PullerConfig {
    /// Quality samples kept per peer during initial block download.
    #[arg(long, default_value_t = DEFAULT_IBD_SAMPLES_COUNT)]
    pub ibd_samples_count: usize,
    /// Quality samples kept per peer outside initial block download.
    #[arg(long, default_value_t = DEFAULT_NORMAL_SAMPLES_COUNT)]
    pub normal_samples_count: usize,
    /// Share of a peer's sample window a single penalty may zero (percent).
    #[arg(long, default_value_t = DEFAULT_MAX_SAMPLES_PERCENTAGE_TO_PENALIZE)]
    pub max_samples_percentage_to_penalize: u32,
    #[arg(long, default_value_t = DEFAULT_MIN_QUALITY_SCORE)]
    pub min_quality_score: f64,
    #[arg(long, default_value_t = DEFAULT_MAX_QUALITY_SCORE)]
    pub max_quality_score: f64,
    /// Score given to peers that have not delivered anything yet.
    #[arg(long, default_value_t = DEFAULT_SAMPLELESS_QUALITY_SCORE)]
    pub sampleless_quality_score: f64,
    /// Speed ceiling used for scoring outside initial block download (bytes/sec).
    #[arg(long, default_value_t = DEFAULT_PEER_SPEED_LIMIT_WHEN_NOT_IN_IBD)]
    pub peer_speed_limit_when_not_in_ibd: u64,
    #[arg(long, default_value_t = DEFAULT_STALLING_LOOP_INTERVAL_MS)]
    pub stalling_loop_interval_ms: u64,
    /// Seconds a peer has to deliver an assigned block before it is reassigned.
    #[arg(long, default_value_t = DEFAULT_MAX_SECONDS_TO_DELIVER_BLOCK)]
    pub max_seconds_to_deliver_block: u64,
    /// Heights above the lowest assigned block that count as urgent when penalizing stalls.
    #[arg(long, default_value_t = DEFAULT_IMPORTANT_HEIGHT_MARGIN)]
    pub important_height_margin: u64,
    /// Floor for the auto-tuned number of blocks in flight.
    #[arg(long, default_value_t = DEFAULT_MIN_BLOCKS_BEING_DOWNLOADED)]
    pub min_blocks_being_downloaded: usize,
    #[arg(long, default_value_t = DEFAULT_AVERAGE_BLOCK_SIZE_SAMPLES)]
    pub average_block_size_samples: usize,
    /// Seconds of aggregate peer throughput kept in flight.
    #[arg(long, default_value_t = DEFAULT_DOWNLOAD_BUFFER_SECS)]
    pub download_buffer_secs: f64,
    #[arg(long, default_value_t = DEFAULT_MIN_PROTOCOL_VERSION)]
    pub min_protocol_version: u32,
    /// Interval for the stats reporter (0 = disabled).
    #[arg(long, default_value_t = DEFAULT_STATS_INTERVAL_SECS)]
    pub stats_interval_secs: u64,
    /// Seed for peer selection (random when unset).
    #[arg(long)]
    pub rng_seed: Option<u64>,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            ibd_samples_count: DEFAULT_IBD_SAMPLES_COUNT,
            normal_samples_count: DEFAULT_NORMAL_SAMPLES_COUNT,
            max_samples_percentage_to_penalize: DEFAULT_MAX_SAMPLES_PERCENTAGE_TO_PENALIZE,
            min_quality_score: DEFAULT_MIN_QUALITY_SCORE,
            max_quality_score: DEFAULT_MAX_QUALITY_SCORE,
            sampleless_quality_score: DEFAULT_SAMPLELESS_QUALITY_SCORE,
            peer_speed_limit_when_not_in_ibd: DEFAULT_PEER_SPEED_LIMIT_WHEN_NOT_IN_IBD,
            stalling_loop_interval_ms: DEFAULT_STALLING_LOOP_INTERVAL_MS,
            max_seconds_to_deliver_block: DEFAULT_MAX_SECONDS_TO_DELIVER_BLOCK,
            important_height_margin: DEFAULT_IMPORTANT_HEIGHT_MARGIN,
            min_blocks_being_downloaded: DEFAULT_MIN_BLOCKS_BEING_DOWNLOADED,
            average_block_size_samples: DEFAULT_AVERAGE_BLOCK_SIZE_SAMPLES,
            download_buffer_secs: DEFAULT_DOWNLOAD_BUFFER_SECS,
            min_protocol_version: DEFAULT_MIN_PROTOCOL_VERSION,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            rng_seed: None,
        }
    }
}

impl PullerConfig {
    /// Reject tuning the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.ibd_samples_count > 0, "ibd_samples_count must be positive");
        ensure!(self.normal_samples_count > 0, "normal_samples_count must be positive");
        ensure!(
            (1..=100).contains(&self.max_samples_percentage_to_penalize),
            "max_samples_percentage_to_penalize must be within 1..=100, got {}",
            self.max_samples_percentage_to_penalize
        );
        ensure!(
            self.min_quality_score > 0.0,
            "min_quality_score must be positive, got {}",
            self.min_quality_score
        );
        ensure!(
            self.min_quality_score <= self.sampleless_quality_score
                && self.sampleless_quality_score <= self.max_quality_score,
            "quality scores must satisfy min <= sampleless <= max ({} / {} / {})",
            self.min_quality_score,
            self.sampleless_quality_score,
            self.max_quality_score
        );
        ensure!(
            self.stalling_loop_interval_ms > 0,
            "stalling_loop_interval_ms must be positive"
        );
        ensure!(
            self.max_seconds_to_deliver_block > 0,
            "max_seconds_to_deliver_block must be positive"
        );
        ensure!(
            self.min_blocks_being_downloaded > 0,
            "min_blocks_being_downloaded must be positive"
        );
        ensure!(
            self.average_block_size_samples > 0,
            "average_block_size_samples must be positive"
        );
        ensure!(
            self.download_buffer_secs > 0.0,
            "download_buffer_secs must be positive, got {}",
            self.download_buffer_secs
        );
        Ok(())
    }

    pub fn stalling_loop_interval(&self) -> Duration {
        Duration::from_millis(self.stalling_loop_interval_ms)
    }

    pub fn max_time_to_deliver_block(&self) -> Duration {
        Duration::from_secs(self.max_seconds_to_deliver_block)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

/// Logging flags.
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
    /// Write JSON-lines logs to this file.
    #[arg(long)]
    pub log_json: Option<PathBuf>,
    /// Filter for the JSON log file.
    #[arg(long, default_value = DEFAULT_LOG_JSON_FILTER)]
    pub log_json_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            log_json: None,
            log_json_filter: DEFAULT_LOG_JSON_FILTER.to_string(),
        }
    }
}
