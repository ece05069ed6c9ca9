//! Per-peer download quality.

use crate::cli::PullerConfig;
use std::collections::VecDeque;

/// Scoring knobs shared by every tracker.
#[derive(Debug, Clone, Copy)]
pub struct QualityConfig {
    pub ibd_samples_count: usize,
    pub normal_samples_count: usize,
    pub max_samples_percentage_to_penalize: u32,
    pub min_score: f64,
    pub max_score: f64,
    pub sampleless_score: f64,
    pub speed_limit_when_not_in_ibd: u64,
}

impl QualityConfig {
    pub fn from_puller_config(config: &PullerConfig) -> Self {
        Self {
            ibd_samples_count: config.ibd_samples_count.max(1),
            normal_samples_count: config.normal_samples_count.max(1),
            max_samples_percentage_to_penalize: config.max_samples_percentage_to_penalize,
            min_score: config.min_quality_score,
            max_score: config.max_quality_score,
            sampleless_score: config.sampleless_quality_score,
            speed_limit_when_not_in_ibd: config.peer_speed_limit_when_not_in_ibd,
        }
    }

    fn window(&self, is_ibd: bool) -> usize {
        if is_ibd {
            self.ibd_samples_count
        } else {
            self.normal_samples_count
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    bytes: u64,
    seconds: f64,
}

/// Rolling throughput window and the score derived from it.
///
/// The score is relative: it only means something next to the best speed
/// among all peers, so callers recompute it whenever that best speed moves.
#[derive(Debug, Clone)]
pub struct PeerQualityTracker {
    config: QualityConfig,
    is_ibd: bool,
    samples: VecDeque<Sample>,
    score: f64,
}

impl PeerQualityTracker {
    pub fn new(config: QualityConfig, is_ibd: bool) -> Self {
        Self {
            config,
            is_ibd,
            samples: VecDeque::with_capacity(config.window(is_ibd)),
            score: config.sampleless_score,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.window(self.is_ibd)
    }

    pub fn samples(&self) -> usize {
        self.samples.len()
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn add_sample(&mut self, bytes: u64, elapsed_seconds: f64) {
        self.samples.push_back(Sample {
            bytes,
            seconds: elapsed_seconds.max(0.0),
        });
        self.truncate();
    }

    /// Record zero-byte samples for undelivered blocks.
    ///
    /// At most `MaxSamplesPercentageToPenalize` of the window is replaced per
    /// call and at least one sample always is.
    pub fn penalize(&mut self, elapsed_seconds: f64, undelivered_count: u32) {
        let cap = self.capacity() as u64 * self.config.max_samples_percentage_to_penalize as u64 / 100;
        let count = (undelivered_count as u64).min(cap).max(1);
        for _ in 0..count {
            self.add_sample(0, elapsed_seconds);
        }
    }

    /// Observed throughput over the window in bytes per second.
    pub fn speed(&self) -> u64 {
        let (bytes, seconds) = self
            .samples
            .iter()
            .fold((0u64, 0f64), |(bytes, seconds), sample| {
                (bytes.saturating_add(sample.bytes), seconds + sample.seconds)
            });
        if seconds <= 0.0 {
            return 0;
        }
        (bytes as f64 / seconds) as u64
    }

    /// Speed used for ranking; capped outside initial block download.
    pub fn scoring_speed(&self) -> u64 {
        let speed = self.speed();
        if self.is_ibd {
            speed
        } else {
            speed.min(self.config.speed_limit_when_not_in_ibd)
        }
    }

    pub fn recalculate_quality_score(&mut self, best_speed_bytes_per_sec: u64) {
        self.score = if self.samples.is_empty() {
            self.config.sampleless_score
        } else if best_speed_bytes_per_sec == 0 {
            self.config.min_score
        } else {
            let ratio = self.scoring_speed() as f64 / best_speed_bytes_per_sec as f64;
            ratio.clamp(self.config.min_score, self.config.max_score)
        };
    }

    pub fn on_ibd_state_changed(&mut self, is_ibd: bool) {
        self.is_ibd = is_ibd;
        self.truncate();
    }

    fn truncate(&mut self) {
        let capacity = self.capacity();
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QualityConfig {
        QualityConfig::from_puller_config(&PullerConfig::default())
    }

    #[test]
    fn speed_is_total_bytes_over_total_time() {
        let mut tracker = PeerQualityTracker::new(config(), true);
        tracker.add_sample(1000, 1.0);
        tracker.add_sample(2000, 1.0);
        tracker.add_sample(1000, 10.0);
        tracker.add_sample(500, 2.0);
        assert_eq!(tracker.speed(), 321);
    }

    #[test]
    fn new_tracker_is_sampleless() {
        let mut tracker = PeerQualityTracker::new(config(), false);
        assert_eq!(tracker.speed(), 0);
        tracker.recalculate_quality_score(1_000);
        assert_eq!(tracker.score(), config().sampleless_score);
    }

    #[test]
    fn window_evicts_oldest_samples() {
        let mut tracker = PeerQualityTracker::new(config(), false);
        tracker.add_sample(1_000_000, 1.0);
        for _ in 0..10 {
            tracker.add_sample(100, 1.0);
        }
        assert_eq!(tracker.samples(), 10);
        assert_eq!(tracker.speed(), 100);
    }

    #[test]
    fn score_is_clamped_to_bounds() {
        let cfg = config();
        let mut tracker = PeerQualityTracker::new(cfg, true);
        tracker.add_sample(10, 1.0);
        tracker.recalculate_quality_score(1_000_000);
        assert_eq!(tracker.score(), cfg.min_score);

        tracker.recalculate_quality_score(5);
        assert_eq!(tracker.score(), cfg.max_score);

        tracker.recalculate_quality_score(0);
        assert_eq!(tracker.score(), cfg.min_score);
    }

    #[test]
    fn faster_peer_never_scores_lower() {
        let mut slow = PeerQualityTracker::new(config(), true);
        let mut fast = PeerQualityTracker::new(config(), true);
        slow.add_sample(1_000, 1.0);
        fast.add_sample(4_000, 1.0);
        let best = fast.scoring_speed();
        slow.recalculate_quality_score(best);
        fast.recalculate_quality_score(best);
        assert!(fast.score() >= slow.score());
        assert!((slow.score() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn penalize_replaces_bounded_share_of_window() {
        let mut tracker = PeerQualityTracker::new(config(), true);
        for _ in 0..200 {
            tracker.add_sample(1_000, 1.0);
        }
        // 10% of a 200-sample window.
        tracker.penalize(5.0, 1_000);
        assert_eq!(tracker.samples(), 200);
        let zeroes = 20u64;
        let expected = ((200 - zeroes) * 1_000) as f64 / ((200 - zeroes) as f64 + zeroes as f64 * 5.0);
        assert_eq!(tracker.speed(), expected as u64);
        assert!(tracker.speed() > 0);
    }

    #[test]
    fn penalize_records_at_least_one_sample() {
        let mut tracker = PeerQualityTracker::new(config(), false);
        tracker.add_sample(1_000, 1.0);
        tracker.penalize(5.0, 0);
        assert_eq!(tracker.samples(), 2);
        assert_eq!(tracker.speed(), 1_000 / 6);
    }

    #[test]
    fn repeated_penalties_converge_to_zero() {
        let mut tracker = PeerQualityTracker::new(config(), false);
        for _ in 0..10 {
            tracker.add_sample(1_000, 1.0);
        }
        for _ in 0..10 {
            tracker.penalize(5.0, 1);
        }
        assert_eq!(tracker.speed(), 0);
    }

    #[test]
    fn ibd_flip_truncates_oldest_samples() {
        let mut tracker = PeerQualityTracker::new(config(), true);
        for n in 0..50u64 {
            tracker.add_sample(n * 10, 1.0);
        }
        assert_eq!(tracker.samples(), 50);

        tracker.on_ibd_state_changed(false);
        assert_eq!(tracker.samples(), 10);
        // Remaining samples are 400..=490.
        assert_eq!(tracker.speed(), 445);

        tracker.on_ibd_state_changed(true);
        assert_eq!(tracker.capacity(), 200);
        assert_eq!(tracker.samples(), 10);
    }

    #[test]
    fn speed_limit_applies_outside_ibd_only() {
        let cfg = config();
        let mut tracker = PeerQualityTracker::new(cfg, true);
        tracker.add_sample(10 * cfg.speed_limit_when_not_in_ibd, 1.0);
        assert_eq!(tracker.scoring_speed(), 10 * cfg.speed_limit_when_not_in_ibd);

        tracker.on_ibd_state_changed(false);
        assert_eq!(tracker.scoring_speed(), cfg.speed_limit_when_not_in_ibd);
        assert_eq!(tracker.speed(), 10 * cfg.speed_limit_when_not_in_ibd);
    }
}
