//! Hand-rolled Prometheus text-format exporter. No `prometheus` crate: metrics are already aggregated into
//! an `AggregatedSnapshot`, so this is a thin text formatter served
//! behind an `axum` handler.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::warn;

use crate::aggregator::{AggregatedSnapshot, Aggregator};
use crate::client::ClientManager;

fn write_gauge(buf: &mut String, name: &str, help: &str, value: f64) {
    let _ = writeln!(buf, "# HELP {name} {help}");
    let _ = writeln!(buf, "# TYPE {name} gauge");
    let _ = writeln!(buf, "{name} {value}");
}

fn write_gauge_labeled(buf: &mut String, name: &str, help: &str, label: &str, value: f64) {
    let _ = writeln!(buf, "# HELP {name} {help}");
    let _ = writeln!(buf, "# TYPE {name} gauge");
    let _ = writeln!(buf, "{name}{{{label}}} {value}");
}

fn write_counter(buf: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(buf, "# HELP {name} {help}");
    let _ = writeln!(buf, "# TYPE {name} counter");
    let _ = writeln!(buf, "{name} {value}");
}

fn write_counter_labeled(buf: &mut String, name: &str, help: &str, label: &str, value: u64) {
    let _ = writeln!(buf, "# HELP {name} {help}");
    let _ = writeln!(buf, "# TYPE {name} counter");
    let _ = writeln!(buf, "{name}{{{label}}} {value}");
}

/// Renders Tier 1 (always) and, when enabled, Tier 2 (per-client)
/// metrics.
pub struct PrometheusExporter {
    aggregator: Arc<Aggregator>,
    client_manager: Arc<ClientManager>,
    target_clients: u32,
    per_client_enabled: bool,
}

impl PrometheusExporter {
    pub fn new(
        aggregator: Arc<Aggregator>,
        client_manager: Arc<ClientManager>,
        target_clients: u32,
        per_client_enabled: bool,
    ) -> Self {
        if per_client_enabled {
            warn!("per-client Prometheus metrics enabled: cardinality scales with client count");
        }
        Self {
            aggregator,
            client_manager,
            target_clients,
            per_client_enabled,
        }
    }

    pub fn render(&self) -> String {
        let snapshot = self.aggregator.get_aggregate();
        let mut buf = String::new();
        self.render_tier1(&mut buf, &snapshot);
        if self.per_client_enabled {
            self.render_tier2(&mut buf);
        }
        buf
    }

    fn render_tier1(&self, buf: &mut String, snap: &AggregatedSnapshot) {
        write_gauge(buf, "hls_swarm_clients_active", "Currently active clients", self.client_manager.len() as f64);
        write_gauge(buf, "hls_swarm_clients_target", "Target client count", self.target_clients as f64);
        let ramp_progress = if self.target_clients == 0 {
            1.0
        } else {
            self.client_manager.len() as f64 / self.target_clients as f64
        };
        write_gauge(buf, "hls_swarm_ramp_progress", "Fraction of target clients started", ramp_progress);

        write_counter(buf, "hls_swarm_manifest_requests_total", "Manifest requests observed", snap.manifest_requests);
        write_counter(buf, "hls_swarm_segment_requests_total", "Segment requests observed", snap.segment_requests);
        write_counter(buf, "hls_swarm_init_requests_total", "Init-segment requests observed", snap.init_requests);
        write_counter(buf, "hls_swarm_unknown_requests_total", "Unclassified requests observed", snap.unknown_requests);

        write_gauge(buf, "hls_swarm_requests_per_second", "Instantaneous request rate", snap.instantaneous.requests_per_sec);
        write_gauge(buf, "hls_swarm_bytes_per_second", "Instantaneous byte rate", snap.instantaneous.bytes_per_sec);

        write_counter(buf, "hls_swarm_bytes_total", "Total bytes across all clients and restarts", snap.total_bytes);
        write_counter(buf, "hls_swarm_segment_bytes_total", "Bytes credited to completed segments", snap.segment_bytes);

        for (name, value) in [
            ("hls_swarm_inferred_segment_latency_us_p50", snap.segment_latency.p50),
            ("hls_swarm_inferred_segment_latency_us_p95", snap.segment_latency.p95),
            ("hls_swarm_inferred_segment_latency_us_p99", snap.segment_latency.p99),
            ("hls_swarm_inferred_segment_latency_us_max", snap.segment_latency.max),
        ] {
            write_gauge(buf, name, "Inferred request latency, microseconds (observation, not TTFB)", value);
        }

        write_counter_labeled(buf, "hls_swarm_http_errors_total", "HTTP error responses", "class=\"4xx\"", snap.http_4xx);
        write_counter_labeled(buf, "hls_swarm_http_errors_total", "HTTP error responses", "class=\"5xx\"", snap.http_5xx);
        write_counter(buf, "hls_swarm_timeouts_total", "TCP/HTTP timeouts observed", snap.timeouts);
        write_counter(buf, "hls_swarm_reconnects_total", "Child-reported reconnects", snap.reconnects);

        write_gauge(buf, "hls_swarm_degraded_clients", "Clients with pipeline drop ratio above threshold", snap.degraded_pipeline_count as f64);
        write_gauge(buf, "hls_swarm_stalled_clients", "Clients currently considered stalled", snap.stalled_count as f64);
        write_gauge(buf, "hls_swarm_high_drift_clients", "Clients above the high-drift threshold", snap.high_drift_count as f64);
        write_gauge(buf, "hls_swarm_peak_drop_ratio", "Highest pipeline drop ratio observed across all clients", snap.peak_drop_ratio);

        for (label, value) in [
            ("p25", snap.throughput.p25),
            ("p50", snap.throughput.p50),
            ("p75", snap.throughput.p75),
            ("p95", snap.throughput.p95),
            ("p99", snap.throughput.p99),
            ("max", snap.throughput.max),
        ] {
            write_gauge_labeled(
                buf,
                "hls_swarm_throughput_bytes_per_second",
                "Throughput percentile, bytes/second",
                &format!("quantile=\"{label}\""),
                value,
            );
        }
    }

    fn render_tier2(&self, buf: &mut String) {
        for stats in self.client_manager.stats_refs() {
            let snap = stats.snapshot(std::time::Duration::from_secs(12));
            let label = format!("client_id=\"{}\"", snap.client_id);
            if let Some(speed) = snap.speed {
                write_gauge_labeled(buf, "hls_swarm_client_speed", "Per-client playback speed multiplier", &label, speed);
            }
            write_gauge_labeled(
                buf,
                "hls_swarm_client_drift_seconds",
                "Per-client drift from the live edge, seconds",
                &label,
                snap.current_drift.as_secs_f64(),
            );
            write_gauge_labeled(
                buf,
                "hls_swarm_client_bytes",
                "Per-client total bytes downloaded",
                &label,
                snap.total_bytes as f64,
            );
        }
    }
}

async fn metrics_handler(State(exporter): State<Arc<PrometheusExporter>>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        exporter.render(),
    )
}

/// Build the `/metrics` router. The caller binds and serves it.
pub fn router(exporter: Arc<PrometheusExporter>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(exporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::parser::SegmentSizeLookup;
    use crate::supervisor::command::NullCommandBuilder;
    use std::time::Duration;

    struct NoopLookup;
    impl SegmentSizeLookup for NoopLookup {
        fn size_of(&self, _filename: &str) -> Option<u64> {
            None
        }
    }

    #[test]
    fn render_includes_tier1_core_series() {
        let config = Arc::new(Config::new(5, Arc::new(NullCommandBuilder)));
        let manager = Arc::new(ClientManager::new(config, Arc::new(NoopLookup)));
        let aggregator = Arc::new(Aggregator::new(
            manager.clone(),
            Duration::from_secs(1),
            Duration::from_secs(12),
            Duration::from_secs(5),
        ));
        let exporter = PrometheusExporter::new(aggregator, manager, 5, false);
        let text = exporter.render();
        assert!(text.contains("hls_swarm_clients_target 5"));
        assert!(text.contains("hls_swarm_peak_drop_ratio"));
    }
}
