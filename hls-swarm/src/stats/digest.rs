//! T-Digest wrapper for inferred-latency percentiles.
//!
//! `tdigest` exposes no merge primitive, which is exactly why the
//! aggregator reconstructs an aggregate digest by resampling each
//! per-client digest at a fixed percentile grid and inserting those
//! samples into a fresh digest, rather than merging the underlying
//! centroids directly.

use parking_lot::Mutex;
use tdigest::TDigest;

/// Fixed percentile grid used both for dashboard/Prometheus export and for
/// cross-client digest reconstruction.
pub const PERCENTILE_GRID: [f64; 6] = [0.25, 0.50, 0.75, 0.90, 0.95, 0.99];

const DIGEST_MAX_SIZE: usize = 100;

/// Mutex-protected digest. Held only for insert and for the short resample
/// during aggregation.
pub struct LatencyDigest {
    inner: Mutex<TDigest>,
}

impl Default for LatencyDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyDigest {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TDigest::new_with_size(DIGEST_MAX_SIZE)),
        }
    }

    /// Record one inferred-latency sample, in microseconds.
    pub fn record(&self, value_us: f64) {
        if !value_us.is_finite() {
            return;
        }
        let mut guard = self.inner.lock();
        let current = std::mem::replace(&mut *guard, TDigest::new_with_size(DIGEST_MAX_SIZE));
        *guard = current.merge_unsorted(vec![value_us]);
    }

    pub fn percentile(&self, q: f64) -> f64 {
        self.inner.lock().estimate_quantile(q)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().count() == 0.0
    }

    /// Sample this digest at the fixed percentile grid, for the
    /// aggregator's resampling-based reconstruction.
    fn resample(&self) -> Vec<f64> {
        let guard = self.inner.lock();
        PERCENTILE_GRID.iter().map(|q| guard.estimate_quantile(*q)).collect()
    }
}

/// Reconstruct an aggregate digest from a set of per-client digests by
/// resampling each at `PERCENTILE_GRID` and inserting the samples into a
/// fresh digest.
pub fn merge_by_resampling<'a>(digests: impl IntoIterator<Item = &'a LatencyDigest>) -> TDigest {
    let mut samples = Vec::new();
    for digest in digests {
        if !digest.is_empty() {
            samples.extend(digest.resample());
        }
    }
    TDigest::new_with_size(DIGEST_MAX_SIZE).merge_unsorted(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_has_no_samples() {
        let d = LatencyDigest::new();
        assert!(d.is_empty());
    }

    #[test]
    fn recording_moves_percentiles() {
        let d = LatencyDigest::new();
        for v in 0..200 {
            d.record(v as f64 * 1000.0);
        }
        assert!(!d.is_empty());
        let p50 = d.percentile(0.5);
        let p99 = d.percentile(0.99);
        assert!(p99 > p50);
    }

    #[test]
    fn merge_by_resampling_combines_multiple_clients() {
        let a = LatencyDigest::new();
        let b = LatencyDigest::new();
        for v in 0..100 {
            a.record(v as f64 * 100.0);
        }
        for v in 100..200 {
            b.record(v as f64 * 100.0);
        }
        let merged = merge_by_resampling([&a, &b]);
        assert!(merged.count() > 0.0);
    }
}
