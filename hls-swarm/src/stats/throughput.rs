//! Throughput histogram: a fixed 64-bucket, log2-spaced
//! atomic histogram of observed throughput samples (bytes/sec), cheap
//! enough to update on every progress tick without contention.

use std::sync::atomic::{AtomicU64, Ordering};

const BUCKETS: usize = 64;

/// Map a throughput sample (bytes/sec) to a bucket index. Bucket `i`
/// covers the half-open range `[2^i, 2^(i+1))`; everything at or below
/// zero falls into bucket 0, and anything at or above `2^63` saturates
/// into the last bucket.
fn bucket_index(value_bps: f64) -> usize {
    if !value_bps.is_finite() || value_bps <= 1.0 {
        return 0;
    }
    let idx = value_bps.log2().floor();
    if idx < 0.0 {
        0
    } else if idx >= (BUCKETS - 1) as f64 {
        BUCKETS - 1
    } else {
        idx as usize
    }
}

/// Lower bound (bytes/sec) of bucket `i`.
fn bucket_floor(i: usize) -> f64 {
    if i == 0 {
        0.0
    } else {
        2f64.powi(i as i32)
    }
}

/// Lock-free throughput histogram. Cloning a snapshot is O(64).
pub struct ThroughputHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_kb: AtomicU64,
}

impl Default for ThroughputHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputHistogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_kb: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value_bps: f64) {
        let idx = bucket_index(value_bps);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        if value_bps.is_finite() && value_bps > 0.0 {
            self.sum_kb.fetch_add((value_bps / 1024.0) as u64, Ordering::Relaxed);
        }
    }

    /// Total samples recorded since the last `drain()`.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Running sum of recorded samples, in KB/sec, since the last `drain()`.
    pub fn sum_kb(&self) -> u64 {
        self.sum_kb.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot of bucket counts. Non-destructive: repeated
    /// calls without an intervening `drain()` return the same totals.
    pub fn snapshot(&self) -> [u64; BUCKETS] {
        let mut out = [0u64; BUCKETS];
        for (i, b) in self.buckets.iter().enumerate() {
            out[i] = b.load(Ordering::Relaxed);
        }
        out
    }

    /// Atomically swap each bucket to zero, returning the prior counts.
    /// The only correct operation for aggregation: a
    /// non-draining read re-adds historical counts on every aggregation
    /// cycle, inflating downstream digests without bound.
    pub fn drain(&self) -> [u64; BUCKETS] {
        let mut out = [0u64; BUCKETS];
        for (i, b) in self.buckets.iter().enumerate() {
            out[i] = b.swap(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum_kb.store(0, Ordering::Relaxed);
        out
    }

    pub fn total(&self) -> u64 {
        self.snapshot().iter().sum()
    }

    /// Approximate the `p`-th percentile (0.0..=1.0) from bucket counts,
    /// interpolating linearly within the winning bucket's range.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        percentile_from_buckets(&self.snapshot(), p)
    }
}

/// Estimate the `p`-th percentile from a bucket-count snapshot.
pub fn percentile_from_buckets(buckets: &[u64; BUCKETS], p: f64) -> Option<f64> {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return None;
    }
    let p = p.clamp(0.0, 1.0);
    let target = (p * total as f64).ceil().max(1.0) as u64;

    let mut cumulative = 0u64;
    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            let floor = bucket_floor(i);
            let ceil = if i + 1 < BUCKETS {
                bucket_floor(i + 1)
            } else {
                floor * 2.0
            };
            // Fraction of the way through this bucket's own count.
            let within = count.max(1);
            let offset_in_bucket = target - (cumulative - count);
            let frac = offset_in_bucket as f64 / within as f64;
            return Some(floor + (ceil - floor) * frac);
        }
    }
    Some(bucket_floor(BUCKETS - 1))
}

/// Element-wise merge of two bucket snapshots, used by the aggregator to
/// combine per-client histograms into a swarm-wide view.
pub fn merge_buckets(a: &[u64; BUCKETS], b: &[u64; BUCKETS]) -> [u64; BUCKETS] {
    let mut out = [0u64; BUCKETS];
    for i in 0..BUCKETS {
        out[i] = a[i] + b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_index_is_monotonic_and_in_range() {
        assert_eq!(bucket_index(0.0), 0);
        assert_eq!(bucket_index(1.0), 0);
        assert!(bucket_index(1024.0) > bucket_index(8.0));
        assert_eq!(bucket_index(f64::INFINITY), BUCKETS - 1);
    }

    #[test]
    fn record_and_percentile_roughly_match_distribution() {
        let hist = ThroughputHistogram::new();
        for _ in 0..100 {
            hist.record(1_000_000.0);
        }
        let p50 = hist.percentile(0.5).unwrap();
        assert!(p50 >= 2f64.powi(19) && p50 < 2f64.powi(21));
    }

    #[test]
    fn empty_histogram_has_no_percentile() {
        let hist = ThroughputHistogram::new();
        assert!(hist.percentile(0.5).is_none());
    }

    #[test]
    fn drain_then_drain_returns_zero_without_new_recordings() {
        let hist = ThroughputHistogram::new();
        hist.record(10.0);
        let first = hist.drain();
        assert_eq!(first.iter().sum::<u64>(), 1);
        let second = hist.drain();
        assert_eq!(second.iter().sum::<u64>(), 0);
    }

    #[test]
    fn count_and_sum_kb_track_recordings_and_reset_on_drain() {
        let hist = ThroughputHistogram::new();
        hist.record(2048.0);
        hist.record(4096.0);
        assert_eq!(hist.count(), 2);
        assert_eq!(hist.sum_kb(), 2 + 4);

        hist.drain();
        assert_eq!(hist.count(), 0);
        assert_eq!(hist.sum_kb(), 0);
    }

    #[test]
    fn merge_buckets_sums_elementwise() {
        let h1 = ThroughputHistogram::new();
        let h2 = ThroughputHistogram::new();
        h1.record(10.0);
        h2.record(10.0);
        h2.record(10.0);
        let merged = merge_buckets(&h1.snapshot(), &h2.snapshot());
        assert_eq!(merged[bucket_index(10.0)], 3);
    }
}
