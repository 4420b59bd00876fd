//! Aggregator: merges per-client
//! state into a point-in-time snapshot, with a TTL-cached destructive
//! drain so two consumers on different cadences never race.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client::ClientManager;
use crate::stats::{merge_buckets, merge_by_resampling, percentile_from_buckets, PERCENTILE_GRID};

/// P25/P50/P75/P95/P99/Max, the fixed percentile set surfaced everywhere
/// latency or throughput is reported.
#[derive(Debug, Clone, Copy, Default)]
pub struct PercentileSet {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

fn percentiles_from_digest(digest: &tdigest::TDigest) -> PercentileSet {
    PercentileSet {
        p25: digest.estimate_quantile(0.25),
        p50: digest.estimate_quantile(0.50),
        p75: digest.estimate_quantile(0.75),
        p95: digest.estimate_quantile(0.95),
        p99: digest.estimate_quantile(0.99),
        max: digest.estimate_quantile(1.0),
    }
}

fn percentiles_from_buckets(buckets: &[u64; 64]) -> PercentileSet {
    PercentileSet {
        p25: percentile_from_buckets(buckets, 0.25).unwrap_or(0.0),
        p50: percentile_from_buckets(buckets, 0.50).unwrap_or(0.0),
        p75: percentile_from_buckets(buckets, 0.75).unwrap_or(0.0),
        p95: percentile_from_buckets(buckets, 0.95).unwrap_or(0.0),
        p99: percentile_from_buckets(buckets, 0.99).unwrap_or(0.0),
        max: percentile_from_buckets(buckets, 1.0).unwrap_or(0.0),
    }
}

/// Simple counters-per-unit-time view, used for both the since-start
/// overall rate and the instantaneous (since-last-snapshot) rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateWindow {
    pub requests_per_sec: f64,
    pub bytes_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct AggregatedSnapshot {
    pub computed_at: Instant,
    pub active_clients: usize,

    pub manifest_requests: u64,
    pub segment_requests: u64,
    pub init_requests: u64,
    pub unknown_requests: u64,

    pub total_bytes: u64,
    pub segment_bytes: u64,

    pub http_4xx: u64,
    pub http_5xx: u64,
    pub timeouts: u64,
    pub reconnects: u64,

    pub manifest_latency: PercentileSet,
    pub segment_latency: PercentileSet,
    pub throughput: PercentileSet,

    pub stalled_count: usize,
    pub high_drift_count: usize,
    pub degraded_pipeline_count: usize,
    pub peak_drop_ratio: f64,

    pub since_start: RateWindow,
    pub instantaneous: RateWindow,
}

struct PrevTotals {
    at: Instant,
    requests: u64,
    bytes: u64,
}

/// Holds non-owning `Arc<ClientStats>` references obtained from the
/// `ClientManager` on every aggregation pass.
pub struct Aggregator {
    client_manager: Arc<ClientManager>,
    cache: Mutex<Option<(Instant, Arc<AggregatedSnapshot>)>>,
    ttl: Duration,
    start_time: Instant,
    prev: Mutex<Option<PrevTotals>>,
    high_drift_threshold: Duration,
    stall_duration_threshold: Duration,
    peak_drop_ratio: AtomicU64,
}

impl Aggregator {
    pub fn new(
        client_manager: Arc<ClientManager>,
        ttl: Duration,
        stall_duration_threshold: Duration,
        high_drift_threshold: Duration,
    ) -> Self {
        Self {
            client_manager,
            cache: Mutex::new(None),
            ttl,
            start_time: Instant::now(),
            prev: Mutex::new(None),
            high_drift_threshold,
            stall_duration_threshold,
            peak_drop_ratio: AtomicU64::new(0),
        }
    }

    pub fn record_pipeline_drop_ratio(&self, ratio: f64) {
        let bits = ratio.to_bits();
        let mut current = self.peak_drop_ratio.load(Ordering::Relaxed);
        while f64::from_bits(current) < ratio {
            match self.peak_drop_ratio.compare_exchange_weak(
                current,
                bits,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn peak_drop_ratio(&self) -> f64 {
        f64::from_bits(self.peak_drop_ratio.load(Ordering::Relaxed))
    }

    /// Returns a cached snapshot when younger than `ttl`, otherwise
    /// computes (and destructively drains) a fresh one. This is the only
    /// correctness-critical path in the module: two consumers on
    /// different cadences must never both trigger a drain for the same
    /// window.
    pub fn get_aggregate(&self) -> Arc<AggregatedSnapshot> {
        let mut cache = self.cache.lock();
        if let Some((at, snapshot)) = cache.as_ref() {
            if at.elapsed() < self.ttl {
                return snapshot.clone();
            }
        }
        let fresh = Arc::new(self.compute_aggregate());
        *cache = Some((Instant::now(), fresh.clone()));
        fresh
    }

    fn compute_aggregate(&self) -> AggregatedSnapshot {
        let refs = self.client_manager.stats_refs();

        let mut manifest_requests = 0u64;
        let mut segment_requests = 0u64;
        let mut init_requests = 0u64;
        let mut unknown_requests = 0u64;
        let mut total_bytes = 0u64;
        let mut segment_bytes = 0u64;
        let mut http_4xx = 0u64;
        let mut http_5xx = 0u64;
        let mut timeouts = 0u64;
        let mut reconnects = 0u64;
        let mut stalled_count = 0usize;
        let mut high_drift_count = 0usize;
        let mut degraded_pipeline_count = 0usize;
        let mut merged_buckets = [0u64; 64];

        for stats in &refs {
            let snap = stats.snapshot(self.stall_duration_threshold);
            manifest_requests += snap.manifest_requests;
            segment_requests += snap.segment_requests;
            init_requests += snap.init_requests;
            unknown_requests += snap.unknown_requests;
            total_bytes += snap.total_bytes;
            segment_bytes += snap.segment_bytes_downloaded;
            http_4xx += snap.http_4xx;
            http_5xx += snap.http_5xx;
            timeouts += snap.timeouts;
            reconnects += snap.reconnects;
            if snap.stalled {
                stalled_count += 1;
            }
            if snap.current_drift >= self.high_drift_threshold {
                high_drift_count += 1;
            }
            if snap.pipeline_degraded {
                degraded_pipeline_count += 1;
            }

            // Destructive: drains this client's histogram into the
            // merged bucket array for this aggregation window.
            let drained = stats.drain_throughput();
            merged_buckets = merge_buckets(&merged_buckets, &drained);
        }

        let manifest_digest =
            merge_by_resampling(refs.iter().map(|s| s.manifest_latency()));
        let segment_digest = merge_by_resampling(refs.iter().map(|s| s.segment_latency()));
        let _ = PERCENTILE_GRID;

        let now = Instant::now();
        let elapsed_since_start = now.saturating_duration_since(self.start_time).as_secs_f64().max(1e-9);
        let total_requests = manifest_requests + segment_requests + init_requests + unknown_requests;

        let since_start = RateWindow {
            requests_per_sec: total_requests as f64 / elapsed_since_start,
            bytes_per_sec: total_bytes as f64 / elapsed_since_start,
        };

        let mut prev = self.prev.lock();
        let instantaneous = match prev.as_ref() {
            Some(p) => {
                let dt = now.saturating_duration_since(p.at).as_secs_f64().max(1e-9);
                RateWindow {
                    requests_per_sec: (total_requests.saturating_sub(p.requests)) as f64 / dt,
                    bytes_per_sec: (total_bytes.saturating_sub(p.bytes)) as f64 / dt,
                }
            }
            None => RateWindow::default(),
        };
        *prev = Some(PrevTotals {
            at: now,
            requests: total_requests,
            bytes: total_bytes,
        });

        AggregatedSnapshot {
            computed_at: now,
            active_clients: refs.len(),
            manifest_requests,
            segment_requests,
            init_requests,
            unknown_requests,
            total_bytes,
            segment_bytes,
            http_4xx,
            http_5xx,
            timeouts,
            reconnects,
            manifest_latency: percentiles_from_digest(&manifest_digest),
            segment_latency: percentiles_from_digest(&segment_digest),
            throughput: percentiles_from_buckets(&merged_buckets),
            stalled_count,
            high_drift_count,
            degraded_pipeline_count,
            peak_drop_ratio: self.peak_drop_ratio(),
            since_start,
            instantaneous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::parser::SegmentSizeLookup;
    use crate::supervisor::command::NullCommandBuilder;

    struct NoopLookup;
    impl SegmentSizeLookup for NoopLookup {
        fn size_of(&self, _filename: &str) -> Option<u64> {
            None
        }
    }

    fn aggregator() -> Aggregator {
        let config = Arc::new(Config::new(0, Arc::new(NullCommandBuilder)));
        let manager = Arc::new(ClientManager::new(config, Arc::new(NoopLookup)));
        Aggregator::new(manager, Duration::from_secs(1), Duration::from_secs(12), Duration::from_secs(5))
    }

    #[test]
    fn empty_manager_yields_zeroed_snapshot() {
        let agg = aggregator();
        let snap = agg.get_aggregate();
        assert_eq!(snap.active_clients, 0);
        assert_eq!(snap.total_bytes, 0);
    }

    #[test]
    fn cached_snapshot_is_identical_within_ttl() {
        let agg = aggregator();
        let a = agg.get_aggregate();
        let b = agg.get_aggregate();
        assert!(Arc::ptr_eq(&a, &b), "within TTL, get_aggregate must return the same cached Arc");
    }

    #[test]
    fn peak_drop_ratio_is_monotonic() {
        let agg = aggregator();
        agg.record_pipeline_drop_ratio(0.2);
        agg.record_pipeline_drop_ratio(0.05);
        assert_eq!(agg.peak_drop_ratio(), 0.2);
        agg.record_pipeline_drop_ratio(0.9);
        assert_eq!(agg.peak_drop_ratio(), 0.9);
    }
}
