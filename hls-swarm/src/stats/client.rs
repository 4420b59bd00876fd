//! Per-client atomic state.
//!
//! Everything on the hot path (bytes, throughput, request counters) is a
//! plain atomic. The two structures that need a lock — the latency
//! digest and the per-HTTP-code small map — are touched only on parsed
//! events, a few hundred per client per minute, never on raw bytes or
//! progress ticks.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::parser::{EventSink, ProgressUpdate, UrlKind};
use crate::stats::digest::LatencyDigest;
use crate::stats::throughput::ThroughputHistogram;

/// How the last child exit is categorized for restart-policy bookkeeping
/// and the exit-code histogram in the exit summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCategory {
    Success,
    Error,
    Signal,
}

pub fn categorize_exit(code: Option<i32>) -> ExitCategory {
    match code {
        Some(0) => ExitCategory::Success,
        Some(_) => ExitCategory::Error,
        None => ExitCategory::Signal,
    }
}

/// Snapshot of one client's counters, taken under no locks except the
/// brief digest/HTTP-map reads.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub client_id: u32,
    pub total_bytes: u64,
    pub segment_bytes_downloaded: u64,
    pub speed: Option<f64>,
    pub current_drift: Duration,
    pub max_drift: Duration,
    pub stalled: bool,
    pub manifest_requests: u64,
    pub segment_requests: u64,
    pub init_requests: u64,
    pub unknown_requests: u64,
    pub http_4xx: u64,
    pub http_5xx: u64,
    pub http_by_code: Vec<(u16, u64)>,
    pub timeouts: u64,
    pub reconnects: u64,
    pub exit_success: u32,
    pub exit_error: u32,
    pub exit_signal: u32,
    pub throughput_buckets: [u64; 64],
    pub pipeline_degraded: bool,
}

/// Per-client atomic state: bytes, speed, drift, request/error counters,
/// the inferred-latency digests, and the throughput histogram.
pub struct ClientStats {
    client_id: u32,
    epoch: Instant,

    bytes_from_prev_runs: AtomicU64,
    current_process_bytes: AtomicU64,
    segment_bytes_downloaded: AtomicU64,

    /// Bit pattern of an `f64`; see `speed()`/`set_speed()`.
    speed_bits: AtomicU64,
    /// Nanoseconds since `epoch` at which speed first dropped below the
    /// stall threshold; 0 means "not currently stalling".
    below_threshold_at_nanos: AtomicU64,

    last_playback_nanos: AtomicU64,
    current_drift_nanos: AtomicI64,
    max_drift_nanos: AtomicI64,

    manifest_requests: AtomicU64,
    segment_requests: AtomicU64,
    init_requests: AtomicU64,
    unknown_requests: AtomicU64,

    http_4xx: AtomicU64,
    http_5xx: AtomicU64,
    http_by_code: Mutex<std::collections::HashMap<u16, u64>>,
    timeouts: AtomicU64,
    reconnects: AtomicU64,

    exit_success: AtomicU32,
    exit_error: AtomicU32,
    exit_signal: AtomicU32,

    manifest_latency: LatencyDigest,
    segment_latency: LatencyDigest,
    throughput: ThroughputHistogram,
    min_wall_time_for_throughput: Duration,

    pipeline_degraded: std::sync::atomic::AtomicBool,
}

impl ClientStats {
    pub fn new(client_id: u32, min_wall_time_for_throughput: Duration) -> Self {
        Self {
            client_id,
            epoch: Instant::now(),
            bytes_from_prev_runs: AtomicU64::new(0),
            current_process_bytes: AtomicU64::new(0),
            segment_bytes_downloaded: AtomicU64::new(0),
            speed_bits: AtomicU64::new(0f64.to_bits()),
            below_threshold_at_nanos: AtomicU64::new(0),
            last_playback_nanos: AtomicU64::new(0),
            current_drift_nanos: AtomicI64::new(0),
            max_drift_nanos: AtomicI64::new(0),
            manifest_requests: AtomicU64::new(0),
            segment_requests: AtomicU64::new(0),
            init_requests: AtomicU64::new(0),
            unknown_requests: AtomicU64::new(0),
            http_4xx: AtomicU64::new(0),
            http_5xx: AtomicU64::new(0),
            http_by_code: Mutex::new(std::collections::HashMap::new()),
            timeouts: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            exit_success: AtomicU32::new(0),
            exit_error: AtomicU32::new(0),
            exit_signal: AtomicU32::new(0),
            manifest_latency: LatencyDigest::new(),
            segment_latency: LatencyDigest::new(),
            throughput: ThroughputHistogram::new(),
            min_wall_time_for_throughput,
            pipeline_degraded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_from_prev_runs.load(Ordering::Relaxed)
            + self.current_process_bytes.load(Ordering::Relaxed)
    }

    pub fn segment_bytes_downloaded(&self) -> u64 {
        self.segment_bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn throughput(&self) -> &ThroughputHistogram {
        &self.throughput
    }

    pub fn manifest_latency(&self) -> &LatencyDigest {
        &self.manifest_latency
    }

    pub fn segment_latency(&self) -> &LatencyDigest {
        &self.segment_latency
    }

    pub fn set_pipeline_degraded(&self, degraded: bool) {
        self.pipeline_degraded.store(degraded, Ordering::Relaxed);
    }

    /// Fold the exited child's bytes into the restart-spanning total and
    /// reset the per-process counter.
    /// `total_bytes` is never allowed to decrease.
    pub fn on_restart(&self, exit_code: Option<i32>) {
        let carried = self.current_process_bytes.swap(0, Ordering::Relaxed);
        self.bytes_from_prev_runs.fetch_add(carried, Ordering::Relaxed);
        match categorize_exit(exit_code) {
            ExitCategory::Success => self.exit_success.fetch_add(1, Ordering::Relaxed),
            ExitCategory::Error => self.exit_error.fetch_add(1, Ordering::Relaxed),
            ExitCategory::Signal => self.exit_signal.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Apply one progress update: updates cumulative bytes, speed, the
    /// stall-crossing timestamp, drift, and (when possible) records an
    /// instantaneous throughput sample.
    pub fn apply_progress(&self, update: &ProgressUpdate, stall_threshold: f64) {
        if let Some(total) = update.total_size {
            if total >= 0 {
                self.current_process_bytes.store(total as u64, Ordering::Relaxed);
            }
        }

        if let Some(speed) = update.speed {
            self.set_speed(speed);
            self.update_stall_crossing(speed, stall_threshold);
        }

        if let Some(out_time) = update.out_time() {
            self.last_playback_nanos
                .store(out_time.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
            let wall = self.epoch.elapsed();
            let drift_nanos = wall.as_nanos() as i64 - out_time.as_nanos() as i64;
            self.current_drift_nanos.store(drift_nanos, Ordering::Relaxed);
            self.max_drift_nanos.fetch_max(drift_nanos, Ordering::Relaxed);
        }
    }

    /// Credit a completed segment's throughput sample, in bytes/sec, once
    /// `wall_time >= min_wall_time`.
    pub fn record_segment_throughput(&self, bytes: u64, wall_time: Duration, min_wall_time: Duration) {
        if wall_time < min_wall_time || wall_time.is_zero() {
            return;
        }
        let bps = bytes as f64 / wall_time.as_secs_f64();
        self.throughput.record(bps);
    }

    fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    /// Store `speed` as the bit pattern of the `f64`. `speed` is monotonic only within a single progress
    /// block so this is a plain store, not a CAS max.
    fn set_speed(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::Relaxed);
    }

    /// CAS-style crossing-time update: record the first transition below
    /// threshold, preserve it while still below, clear on recovery.
    fn update_stall_crossing(&self, speed: f64, threshold: f64) {
        if speed > 0.0 && speed < threshold {
            let already = self.below_threshold_at_nanos.load(Ordering::Relaxed);
            if already == 0 {
                let now_nanos = self.epoch.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
                // Use a sentinel-safe value: 0 is reserved for "not stalling",
                // so nudge a genuine zero-elapsed reading to 1.
                let now_nanos = now_nanos.max(1);
                let _ = self.below_threshold_at_nanos.compare_exchange(
                    0,
                    now_nanos,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
        } else {
            self.below_threshold_at_nanos.store(0, Ordering::Relaxed);
        }
    }

    /// A client is stalled iff the crossing timestamp is set and older
    /// than `stall_duration_threshold`.
    pub fn stalled(&self, stall_duration_threshold: Duration) -> bool {
        let crossing = self.below_threshold_at_nanos.load(Ordering::Relaxed);
        if crossing == 0 {
            return false;
        }
        let now_nanos = self.epoch.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
        let since = Duration::from_nanos(now_nanos.saturating_sub(crossing));
        since >= stall_duration_threshold
    }

    pub fn current_drift(&self) -> Duration {
        let nanos = self.current_drift_nanos.load(Ordering::Relaxed);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    pub fn max_drift(&self) -> Duration {
        Duration::from_nanos(self.max_drift_nanos.load(Ordering::Relaxed).max(0) as u64)
    }

    pub fn snapshot(&self, stall_duration_threshold: Duration) -> ClientSnapshot {
        let http_by_code = self
            .http_by_code
            .lock()
            .iter()
            .map(|(&code, &count)| (code, count))
            .collect();

        ClientSnapshot {
            client_id: self.client_id,
            total_bytes: self.total_bytes(),
            segment_bytes_downloaded: self.segment_bytes_downloaded(),
            speed: {
                let s = self.speed();
                if s.is_finite() && s != 0.0 {
                    Some(s)
                } else {
                    None
                }
            },
            current_drift: self.current_drift(),
            max_drift: self.max_drift(),
            stalled: self.stalled(stall_duration_threshold),
            manifest_requests: self.manifest_requests.load(Ordering::Relaxed),
            segment_requests: self.segment_requests.load(Ordering::Relaxed),
            init_requests: self.init_requests.load(Ordering::Relaxed),
            unknown_requests: self.unknown_requests.load(Ordering::Relaxed),
            http_4xx: self.http_4xx.load(Ordering::Relaxed),
            http_5xx: self.http_5xx.load(Ordering::Relaxed),
            http_by_code,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            exit_success: self.exit_success.load(Ordering::Relaxed),
            exit_error: self.exit_error.load(Ordering::Relaxed),
            exit_signal: self.exit_signal.load(Ordering::Relaxed),
            throughput_buckets: self.throughput.snapshot(),
            pipeline_degraded: self.pipeline_degraded.load(Ordering::Relaxed),
        }
    }

    /// Drain this client's throughput histogram, returning the prior
    /// bucket counts. Destructive; used only by the aggregator.
    pub fn drain_throughput(&self) -> [u64; 64] {
        self.throughput.drain()
    }
}

impl EventSink for ClientStats {
    fn record_request(&self, kind: UrlKind) {
        match kind {
            UrlKind::Manifest => self.manifest_requests.fetch_add(1, Ordering::Relaxed),
            UrlKind::Segment => self.segment_requests.fetch_add(1, Ordering::Relaxed),
            UrlKind::Init => self.init_requests.fetch_add(1, Ordering::Relaxed),
            UrlKind::Unknown => self.unknown_requests.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_http_error(&self, code: u16) {
        if (400..500).contains(&code) {
            self.http_4xx.fetch_add(1, Ordering::Relaxed);
        } else if (500..600).contains(&code) {
            self.http_5xx.fetch_add(1, Ordering::Relaxed);
        }
        *self.http_by_code.lock().entry(code).or_insert(0) += 1;
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_inferred_latency(&self, kind: UrlKind, latency: Duration) {
        let micros = latency.as_micros() as f64;
        match kind {
            UrlKind::Manifest => self.manifest_latency.record(micros),
            UrlKind::Segment | UrlKind::Init => self.segment_latency.record(micros),
            UrlKind::Unknown => {}
        }
    }

    fn credit_segment_bytes(&self, bytes: u64) {
        self.segment_bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    fn credit_segment_throughput(&self, bytes: u64, wall_time: Duration) {
        self.record_segment_throughput(bytes, wall_time, self.min_wall_time_for_throughput);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ProgressState;

    fn progress(total_size: Option<i64>, speed: Option<f64>) -> ProgressUpdate {
        ProgressUpdate {
            total_size,
            out_time_us: Some(1_000_000),
            speed,
            progress: ProgressState::Continue,
            received_at: Instant::now(),
        }
    }

    #[test]
    fn restart_preserves_prior_bytes_and_is_monotonic() {
        let stats = ClientStats::new(0, Duration::from_micros(100));
        stats.apply_progress(&progress(Some(5_000_000), Some(1.0)), 0.9);
        assert_eq!(stats.total_bytes(), 5_000_000);

        stats.on_restart(Some(0));
        assert_eq!(stats.total_bytes(), 5_000_000, "bytes survive the restart");

        stats.apply_progress(&progress(Some(3_000_000), Some(1.0)), 0.9);
        assert_eq!(stats.total_bytes(), 8_000_000);
    }

    #[test]
    fn stall_crossing_tracks_below_threshold_window() {
        let stats = ClientStats::new(0, Duration::from_micros(100));
        stats.apply_progress(&progress(Some(0), Some(0.1)), 0.9);
        assert!(!stats.stalled(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(stats.stalled(Duration::from_millis(5)));

        stats.apply_progress(&progress(Some(0), Some(1.0)), 0.9);
        assert!(!stats.stalled(Duration::from_millis(0)), "recovery clears the crossing");
    }

    #[test]
    fn event_sink_counters_increment() {
        let stats = ClientStats::new(0, Duration::from_micros(100));
        stats.record_request(UrlKind::Segment);
        stats.record_http_error(404);
        stats.record_http_error(503);
        stats.record_timeout();
        stats.record_reconnect();
        stats.credit_segment_bytes(1024);

        let snap = stats.snapshot(Duration::from_secs(12));
        assert_eq!(snap.segment_requests, 1);
        assert_eq!(snap.http_4xx, 1);
        assert_eq!(snap.http_5xx, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.segment_bytes_downloaded, 1024);
    }

    #[test]
    fn event_sink_credits_throughput_above_min_wall_time() {
        let stats = ClientStats::new(0, Duration::from_millis(1));
        stats.credit_segment_throughput(1_000_000, Duration::from_millis(10));
        assert_eq!(stats.throughput().count(), 1);

        stats.credit_segment_throughput(1_000_000, Duration::from_micros(1));
        assert_eq!(stats.throughput().count(), 1, "below min_wall_time is dropped");
    }

    #[test]
    fn max_drift_never_decreases() {
        let stats = ClientStats::new(0, Duration::from_micros(100));
        stats.current_drift_nanos.store(100, Ordering::Relaxed);
        stats.max_drift_nanos.fetch_max(100, Ordering::Relaxed);
        stats.current_drift_nanos.store(10, Ordering::Relaxed);
        stats.max_drift_nanos.fetch_max(10, Ordering::Relaxed);
        assert_eq!(stats.max_drift_nanos.load(Ordering::Relaxed), 100);
    }
}
