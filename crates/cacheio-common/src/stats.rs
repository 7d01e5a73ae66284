//! Engine statistics.
//!
//! A single shared counters block, mutated through atomics and never
//! structurally locked. Latency distributions use logarithmic bucket
//! histograms so recording stays wait-free on the hot paths.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Bucket upper bounds in microseconds.
const BUCKET_BOUNDARIES_US: [u64; 16] = [
    10,
    20,
    50,
    100,
    200,
    500,
    1_000,
    2_000,
    5_000,
    10_000,
    20_000,
    50_000,
    100_000,
    200_000,
    500_000,
    u64::MAX,
];

/// Log-bucketed latency histogram.
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; 16],
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample in microseconds.
    pub fn record(&self, latency_us: u64) {
        let idx = BUCKET_BOUNDARIES_US
            .iter()
            .position(|&b| latency_us <= b)
            .unwrap_or(BUCKET_BOUNDARIES_US.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_us, Ordering::Relaxed);
        store_max(&self.max, latency_us);
    }

    /// Start a timer that records its elapsed time when dropped.
    pub fn time(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histo: self,
            start: Instant::now(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Mean sample in microseconds, zero when empty.
    pub fn mean(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            0
        } else {
            self.sum.load(Ordering::Relaxed) / count
        }
    }

    /// Bucket (upper-bound, count) pairs for exposition.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        BUCKET_BOUNDARIES_US
            .iter()
            .zip(self.buckets.iter())
            .map(|(&b, c)| (b, c.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Guard returned by [`Histogram::time`].
pub struct HistogramTimer<'a> {
    histo: &'a Histogram,
    start: Instant,
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        self.histo.record(self.start.elapsed().as_micros() as u64);
    }
}

/// Raise an atomic to `v` if `v` is larger.
pub fn store_max(slot: &AtomicU64, v: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    while v > current {
        match slot.compare_exchange_weak(current, v, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(seen) => current = seen,
        }
    }
}

/// Saturating atomic decrement; a counter that would go negative pins at
/// zero instead of wrapping.
pub fn decr(slot: &AtomicU64, v: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_sub(v);
        match slot.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(seen) => current = seen,
        }
    }
}

/// The engine-wide counters block.
///
/// Limits (`max_size`, watermarks, aging knobs) live here too so the hash
/// table and flusher can consult them without a handle to the config.
#[derive(Debug, Default)]
pub struct CacheStats {
    // Limits.
    pub max_size: AtomicU64,
    pub mem_high_wat: AtomicU64,
    pub mem_low_wat: AtomicU64,
    pub min_data_age: AtomicU32,
    pub queue_age_cap: AtomicU32,

    // Memory accounting.
    /// Resident bytes of all stored values.
    pub current_size: AtomicU64,
    /// Logical bytes of all stored values, ejected or not.
    pub total_cache_size: AtomicU64,
    /// Bookkeeping overhead (queued items and the like).
    pub mem_overhead: AtomicU64,

    // Mutation queue.
    pub total_enqueued: AtomicU64,
    pub queue_size: AtomicU64,
    pub flusher_todo: AtomicU64,

    // Flusher.
    pub flush_duration: AtomicU64,
    pub flush_duration_high_wat: AtomicU64,
    pub cumulative_flush_time: AtomicU64,
    pub commit_time: AtomicU64,
    pub cumulative_commit_time: AtomicU64,
    pub commit_failed: AtomicU64,
    pub flusher_commits: AtomicU64,
    pub flusher_preempts: AtomicU64,
    pub flush_failed: AtomicU64,
    pub flush_expired: AtomicU64,
    pub too_young: AtomicU64,
    pub too_old: AtomicU64,
    pub dirty_age: AtomicU64,
    pub dirty_age_high_wat: AtomicU64,
    pub data_age: AtomicU64,
    pub data_age_high_wat: AtomicU64,
    pub new_items: AtomicU64,
    pub del_items: AtomicU64,

    // Residency.
    pub num_value_ejects: AtomicU64,
    pub num_non_resident: AtomicU64,
    pub expired: AtomicU64,

    // Admission.
    pub num_not_my_vbuckets: AtomicU64,

    // Background fetches.
    pub bg_fetched: AtomicU64,
    pub bg_num_operations: AtomicU64,

    // Warmup.
    pub warm_dups: AtomicU64,
    pub warm_oom: AtomicU64,
    pub warmed_up: AtomicU64,

    // VBucket deletion.
    pub vbucket_deletions: AtomicU64,
    pub vbucket_del_fail: AtomicU64,

    // Disk latency distributions.
    pub disk_insert_histo: Histogram,
    pub disk_update_histo: Histogram,
    pub disk_del_histo: Histogram,
    pub disk_commit_histo: Histogram,
    pub disk_vb_del_histo: Histogram,
    pub bg_wait_histo: Histogram,
    pub bg_load_histo: Histogram,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_and_mean() {
        let h = Histogram::new();
        h.record(5);
        h.record(15);
        h.record(1_000_000);
        assert_eq!(h.count(), 3);
        assert_eq!(h.max(), 1_000_000);
        assert_eq!(h.mean(), (5 + 15 + 1_000_000) / 3);
        let snap = h.snapshot();
        assert_eq!(snap[0].1, 1); // <= 10us
        assert_eq!(snap[1].1, 1); // <= 20us
        assert_eq!(snap[15].1, 1); // overflow bucket
    }

    #[test]
    fn test_timer_records_once() {
        let h = Histogram::new();
        {
            let _t = h.time();
        }
        assert_eq!(h.count(), 1);
    }

    #[test]
    fn test_store_max_and_decr() {
        let a = AtomicU64::new(10);
        store_max(&a, 5);
        assert_eq!(a.load(Ordering::Relaxed), 10);
        store_max(&a, 20);
        assert_eq!(a.load(Ordering::Relaxed), 20);
        decr(&a, 25);
        assert_eq!(a.load(Ordering::Relaxed), 0);
    }
}
