//! Cache Metrics Collection
//!
//! Counters for monitoring how lookups resolve across the tiers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookup outcomes
    hits: AtomicU64,
    misses: AtomicU64,
    lookup_errors: AtomicU64,
    /// Hits keyed by tier distance
    hits_by_distance: DashMap<u32, AtomicU64>,

    // Verification
    bytes_verified: AtomicU64,
    checksum_rejections: AtomicU64,

    // Writes
    promotions: AtomicU64,
    stores: AtomicU64,

    // Fetch latency (microseconds, exponential moving average)
    fetch_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, distance: u32) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.hits_by_distance
            .entry(distance)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_error(&self) {
        self.lookup_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_verified(&self, bytes: u64) {
        self.bytes_verified.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.checksum_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record entries written into closer tiers by one promotion
    pub fn record_promotions(&self, tiers: usize) {
        self.promotions.fetch_add(tiers as u64, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hits served by the tier at `distance`
    pub fn hits_at(&self, distance: u32) -> u64 {
        self.hits_by_distance
            .get(&distance)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn checksum_rejections(&self) -> u64 {
        self.checksum_rejections.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    // Latency tracking
    pub fn record_fetch_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.fetch_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .fetch_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn fetch_latency(&self) -> Duration {
        Duration::from_micros(self.fetch_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            lookup_errors: self.lookup_errors.load(Ordering::Relaxed),
            hits_by_distance: self
                .hits_by_distance
                .iter()
                .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
                .collect(),
            hit_ratio: self.hit_ratio(),
            bytes_verified: self.bytes_verified.load(Ordering::Relaxed),
            checksum_rejections: self.checksum_rejections(),
            promotions: self.promotions(),
            stores: self.stores.load(Ordering::Relaxed),
            fetch_latency: self.fetch_latency(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.lookup_errors.store(0, Ordering::Relaxed);
        self.hits_by_distance.clear();
        self.bytes_verified.store(0, Ordering::Relaxed);
        self.checksum_rejections.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.stores.store(0, Ordering::Relaxed);
        self.fetch_latency_us.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub lookup_errors: u64,
    pub hits_by_distance: BTreeMap<u32, u64>,
    pub hit_ratio: f64,
    pub bytes_verified: u64,
    pub checksum_rejections: u64,
    pub promotions: u64,
    pub stores: u64,
    pub fetch_latency: Duration,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
