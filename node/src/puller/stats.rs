//! Puller statistics.

use crate::p2p::PeerId;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Mean over the last `window` values.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window: usize,
    values: VecDeque<u64>,
    sum: u64,
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            values: VecDeque::with_capacity(window),
            sum: 0,
        }
    }

    pub fn push(&mut self, value: u64) {
        self.values.push_back(value);
        self.sum = self.sum.saturating_add(value);
        while self.values.len() > self.window {
            if let Some(evicted) = self.values.pop_front() {
                self.sum = self.sum.saturating_sub(evicted);
            }
        }
    }

    /// Zero until the first value arrives.
    pub fn average(&self) -> u64 {
        if self.values.is_empty() {
            0
        } else {
            self.sum / self.values.len() as u64
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PullerCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    reassigned: AtomicU64,
    stalled: AtomicU64,
    request_failures: AtomicU64,
    ignored_deliveries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub reassigned: u64,
    pub stalled: u64,
    pub request_failures: u64,
    pub ignored_deliveries: u64,
}

impl PullerCounters {
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_reassigned(&self, count: u64) {
        self.reassigned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_stalled(&self, count: u64) {
        self.stalled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_request_failure(&self) {
        self.request_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored_delivery(&self) {
        self.ignored_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reassigned: self.reassigned.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            ignored_deliveries: self.ignored_deliveries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PullerStats {
    pub peers: usize,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub queued_jobs: usize,
    pub queued_headers: usize,
    pub reassignment_jobs: usize,
    pub reassignment_headers: usize,
    pub outstanding: usize,
    pub average_block_size: u64,
    pub total_speed_bytes_per_sec: u64,
    pub is_ibd: bool,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerQualityDump {
    pub peer_id: PeerId,
    pub score: f64,
    pub speed_bytes_per_sec: u64,
    pub samples: usize,
    pub in_flight: usize,
    pub tip_height: u64,
}
