//! Exit summary: printed to stdout at shutdown, and also
//! exposed as a value so automation can consume it directly.

use std::fmt;

use serde::Serialize;

use crate::aggregator::AggregatedSnapshot;
use crate::client::ClientManager;
use crate::supervisor::SupervisorState;

#[derive(Debug, Clone, Serialize)]
pub struct RequestStats {
    pub manifest: u64,
    pub segment: u64,
    pub init: u64,
    pub unknown: u64,
    pub total_bytes: u64,
    pub segment_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub manifest_p50_us: f64,
    pub manifest_p95_us: f64,
    pub manifest_p99_us: f64,
    pub segment_p50_us: f64,
    pub segment_p95_us: f64,
    pub segment_p99_us: f64,
    /// This is never a measured TTFB — only the interval between an
    /// observed request-open and the next observed request event for the
    /// same client.
    pub disclaimer: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackHealth {
    pub stalled_clients: usize,
    pub high_drift_clients: usize,
    pub degraded_pipeline_clients: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSummary {
    pub clients_started: usize,
    pub total_restarts: u32,
    pub running: usize,
    pub backoff: usize,
    pub stopped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub http_4xx: u64,
    pub http_5xx: u64,
    pub timeouts: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitCodeHistogram {
    pub success: u32,
    pub error: u32,
    pub signal: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitSummary {
    pub requests: RequestStats,
    pub latency: LatencySummary,
    pub playback_health: PlaybackHealth,
    pub lifecycle: LifecycleSummary,
    pub errors: ErrorSummary,
    pub exit_codes: ExitCodeHistogram,
    pub peak_drop_ratio: f64,
    /// Only populated with footnotes that are actually non-zero.
    pub footnotes: Vec<String>,
}

impl ExitSummary {
    pub fn build(snapshot: &AggregatedSnapshot, client_manager: &ClientManager) -> Self {
        let supervisors = client_manager.supervisors();
        let mut running = 0;
        let mut backoff = 0;
        let mut stopped = 0;
        let mut total_restarts = 0u32;
        let mut exit_success = 0u32;
        let mut exit_error = 0u32;
        let mut exit_signal = 0u32;

        for supervisor in &supervisors {
            match supervisor.state() {
                SupervisorState::Running | SupervisorState::Starting | SupervisorState::Created => {
                    running += 1
                }
                SupervisorState::Backoff => backoff += 1,
                SupervisorState::Stopped => stopped += 1,
            }
            total_restarts += supervisor.restart_count();
        }
        for stats in client_manager.stats_refs() {
            let snap = stats.snapshot(std::time::Duration::from_secs(12));
            exit_success += snap.exit_success;
            exit_error += snap.exit_error;
            exit_signal += snap.exit_signal;
        }

        let mut footnotes = Vec::new();
        if snapshot.unknown_requests > 0 {
            footnotes.push(format!(
                "{} unclassified URL observations (check CDN edge path shapes)",
                snapshot.unknown_requests
            ));
        }
        if snapshot.peak_drop_ratio > 0.0 {
            footnotes.push(format!(
                "peak pipeline drop ratio {:.4} on at least one client",
                snapshot.peak_drop_ratio
            ));
        }

        Self {
            requests: RequestStats {
                manifest: snapshot.manifest_requests,
                segment: snapshot.segment_requests,
                init: snapshot.init_requests,
                unknown: snapshot.unknown_requests,
                total_bytes: snapshot.total_bytes,
                segment_bytes: snapshot.segment_bytes,
            },
            latency: LatencySummary {
                manifest_p50_us: snapshot.manifest_latency.p50,
                manifest_p95_us: snapshot.manifest_latency.p95,
                manifest_p99_us: snapshot.manifest_latency.p99,
                segment_p50_us: snapshot.segment_latency.p50,
                segment_p95_us: snapshot.segment_latency.p95,
                segment_p99_us: snapshot.segment_latency.p99,
                disclaimer: "inferred from observation-log event spacing, not measured TTFB",
            },
            playback_health: PlaybackHealth {
                stalled_clients: snapshot.stalled_count,
                high_drift_clients: snapshot.high_drift_count,
                degraded_pipeline_clients: snapshot.degraded_pipeline_count,
            },
            lifecycle: LifecycleSummary {
                clients_started: supervisors.len(),
                total_restarts,
                running,
                backoff,
                stopped,
            },
            errors: ErrorSummary {
                http_4xx: snapshot.http_4xx,
                http_5xx: snapshot.http_5xx,
                timeouts: snapshot.timeouts,
                reconnects: snapshot.reconnects,
            },
            exit_codes: ExitCodeHistogram {
                success: exit_success,
                error: exit_error,
                signal: exit_signal,
            },
            peak_drop_ratio: snapshot.peak_drop_ratio,
            footnotes,
        }
    }
}

impl fmt::Display for ExitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== hls-swarm exit summary ===")?;
        writeln!(f, "-- request statistics --")?;
        writeln!(
            f,
            "manifest={} segment={} init={} unknown={} bytes={} segment_bytes={}",
            self.requests.manifest,
            self.requests.segment,
            self.requests.init,
            self.requests.unknown,
            self.requests.total_bytes,
            self.requests.segment_bytes
        )?;
        writeln!(f, "-- inferred latency ({}) --", self.latency.disclaimer)?;
        writeln!(
            f,
            "manifest p50/p95/p99 = {:.0}/{:.0}/{:.0} us; segment p50/p95/p99 = {:.0}/{:.0}/{:.0} us",
            self.latency.manifest_p50_us,
            self.latency.manifest_p95_us,
            self.latency.manifest_p99_us,
            self.latency.segment_p50_us,
            self.latency.segment_p95_us,
            self.latency.segment_p99_us
        )?;
        writeln!(f, "-- playback health --")?;
        writeln!(
            f,
            "stalled={} high_drift={} degraded_pipelines={}",
            self.playback_health.stalled_clients,
            self.playback_health.high_drift_clients,
            self.playback_health.degraded_pipeline_clients
        )?;
        writeln!(f, "-- lifecycle --")?;
        writeln!(
            f,
            "started={} restarts={} running={} backoff={} stopped={}",
            self.lifecycle.clients_started,
            self.lifecycle.total_restarts,
            self.lifecycle.running,
            self.lifecycle.backoff,
            self.lifecycle.stopped
        )?;
        writeln!(f, "-- errors --")?;
        writeln!(
            f,
            "http_4xx={} http_5xx={} timeouts={} reconnects={}",
            self.errors.http_4xx, self.errors.http_5xx, self.errors.timeouts, self.errors.reconnects
        )?;
        writeln!(f, "-- exit codes --")?;
        writeln!(
            f,
            "success={} error={} signal={}",
            self.exit_codes.success, self.exit_codes.error, self.exit_codes.signal
        )?;
        if !self.footnotes.is_empty() {
            writeln!(f, "-- footnotes --")?;
            for note in &self.footnotes {
                writeln!(f, "* {note}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{PercentileSet, RateWindow};
    use crate::config::Config;
    use crate::parser::SegmentSizeLookup;
    use crate::supervisor::command::NullCommandBuilder;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct NoopLookup;
    impl SegmentSizeLookup for NoopLookup {
        fn size_of(&self, _filename: &str) -> Option<u64> {
            None
        }
    }

    fn empty_snapshot() -> AggregatedSnapshot {
        AggregatedSnapshot {
            computed_at: Instant::now(),
            active_clients: 0,
            manifest_requests: 0,
            segment_requests: 0,
            init_requests: 0,
            unknown_requests: 7,
            total_bytes: 0,
            segment_bytes: 0,
            http_4xx: 0,
            http_5xx: 0,
            timeouts: 0,
            reconnects: 0,
            manifest_latency: PercentileSet::default(),
            segment_latency: PercentileSet::default(),
            throughput: PercentileSet::default(),
            stalled_count: 0,
            high_drift_count: 0,
            degraded_pipeline_count: 0,
            peak_drop_ratio: 0.0,
            since_start: RateWindow::default(),
            instantaneous: RateWindow::default(),
        }
    }

    #[test]
    fn footnote_present_only_when_unknown_requests_nonzero() {
        let config = Arc::new(Config::new(0, Arc::new(NullCommandBuilder)));
        let manager = ClientManager::new(config, Arc::new(NoopLookup));
        let snap = empty_snapshot();
        let summary = ExitSummary::build(&snap, &manager);
        assert_eq!(summary.footnotes.len(), 1);
        assert!(summary.footnotes[0].contains("unclassified"));
    }

    #[test]
    fn display_renders_all_sections() {
        let config = Arc::new(Config::new(0, Arc::new(NullCommandBuilder)));
        let manager = ClientManager::new(config, Arc::new(NoopLookup));
        let snap = empty_snapshot();
        let summary = ExitSummary::build(&snap, &manager);
        let text = summary.to_string();
        assert!(text.contains("request statistics"));
        assert!(text.contains("exit codes"));
    }
}
