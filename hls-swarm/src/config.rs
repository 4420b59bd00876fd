//! Harness configuration.
//!
//! Flag/file parsing is out of scope; this module only defines
//! the `Config` value type and its defaults.

use std::sync::Arc;
use std::time::Duration;

use crate::supervisor::command::CommandBuilder;

/// How a client's progress channel is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Per-client Unix domain socket (`unix://<path>`).
    UnixSocket,
    /// `stdout` fallback, used when sockets are unsupported or the path
    /// would exceed the platform length limit.
    Stdout,
}

/// Top-level harness configuration, assembled by the embedding host.
#[derive(Clone)]
pub struct Config {
    /// Target number of concurrent clients.
    pub target_clients: u32,
    /// Clients started per second during ramp-up.
    pub ramp_rate: f64,
    /// Seed combined (XOR) with each client id to derive per-client jitter.
    pub config_seed: u64,
    /// Upper bound (exclusive) of the per-client ramp jitter.
    pub max_ramp_jitter: Duration,

    /// Pipeline channel capacity (per pipeline, per client).
    pub pipeline_capacity: usize,
    /// Drop-rate threshold above which a pipeline is `degraded()`.
    pub pipeline_drop_threshold: f64,
    /// Drain timeout used during pipeline shutdown.
    pub pipeline_drain_timeout: Duration,

    /// Preferred progress channel transport.
    pub progress_mode: ProgressMode,
    /// Grace window for the child to connect to the progress socket.
    pub progress_grace_window: Duration,

    /// Initial backoff delay after a crash.
    pub backoff_initial: Duration,
    /// Backoff multiplier applied per consecutive restart.
    pub backoff_multiplier: f64,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Per-client jitter fraction applied to backoff delays (±20% default).
    pub backoff_jitter_fraction: f64,
    /// Uptime required to reset the restart-attempt counter.
    pub backoff_reset_uptime: Duration,
    /// Maximum restart attempts before a client is terminally stopped.
    /// `None` means unbounded.
    pub max_restarts: Option<u32>,
    /// Timeout for the graceful-stop escalation (SIGTERM -> SIGKILL).
    pub graceful_stop_timeout: Duration,

    /// Speed below which a client is considered to be stalling.
    pub stall_speed_threshold: f64,
    /// Duration the speed must remain below threshold before `stalled()`.
    pub stall_duration_threshold: Duration,
    /// In-flight request TTL before being swept as hanging.
    pub inflight_request_ttl: Duration,

    /// Segment-size scrape base interval.
    pub scrape_interval: Duration,
    /// Jitter applied around the scrape interval.
    pub scrape_jitter: Duration,
    /// Rolling window size (segment count) retained by the scrape cache.
    pub scrape_window: u64,
    /// Per-request HTTP timeout for the scraper.
    pub scrape_request_timeout: Duration,
    /// Response body size cap for the scraper.
    pub scrape_response_cap_bytes: usize,
    /// Bounded wait for the first successful refresh at cold start.
    pub scrape_cold_start_timeout: Duration,

    /// Aggregate snapshot cache TTL.
    pub aggregate_cache_ttl: Duration,
    /// Minimum wall-time for a throughput sample to be recorded (avoids
    /// division blowups on near-instant segment completions).
    pub min_wall_time_for_throughput: Duration,

    /// Prometheus bind address, if the endpoint should be served.
    pub prometheus_bind: Option<std::net::SocketAddr>,
    /// Enable Tier 2 (per-client) Prometheus metrics.
    pub prometheus_per_client: bool,

    /// Enable the terminal dashboard model update loop.
    pub dashboard_enabled: bool,
    /// Dashboard refresh cadence.
    pub dashboard_tick: Duration,
    /// Metrics refresh cadence (drives the aggregate cache TTL cadence).
    pub metrics_tick: Duration,

    /// Optional run duration; `None` runs until a shutdown signal.
    pub run_duration: Option<Duration>,

    /// Injected child-process command builder.
    pub command_builder: Arc<dyn CommandBuilder>,

    /// Origin base URL the segment-size index is derived from when no
    /// explicit `segment_sizes_url` override is given.
    pub origin_host: String,
    /// Explicit override for the segment-size JSON endpoint.
    pub segment_sizes_url: Option<String>,

    /// Swarm/version string embedded in the per-client User-Agent.
    pub swarm_name: String,
    pub swarm_version: String,
}

impl Config {
    pub fn new(target_clients: u32, command_builder: Arc<dyn CommandBuilder>) -> Self {
        Self {
            target_clients,
            command_builder,
            ..Self::default_with_placeholder_builder()
        }
    }

    fn default_with_placeholder_builder() -> Self {
        Self {
            target_clients: 0,
            ramp_rate: 5.0,
            config_seed: 0,
            max_ramp_jitter: Duration::from_millis(200),

            pipeline_capacity: 1000,
            pipeline_drop_threshold: 0.01,
            pipeline_drain_timeout: Duration::from_secs(5),

            progress_mode: ProgressMode::UnixSocket,
            progress_grace_window: Duration::from_secs(3),

            backoff_initial: Duration::from_millis(250),
            backoff_multiplier: 1.7,
            backoff_max: Duration::from_secs(5),
            backoff_jitter_fraction: 0.2,
            backoff_reset_uptime: Duration::from_secs(30),
            max_restarts: None,
            graceful_stop_timeout: Duration::from_secs(5),

            stall_speed_threshold: 0.9,
            stall_duration_threshold: Duration::from_secs(12),
            inflight_request_ttl: Duration::from_secs(60),

            scrape_interval: Duration::from_secs(5),
            scrape_jitter: Duration::from_millis(500),
            scrape_window: 30,
            scrape_request_timeout: Duration::from_secs(5),
            scrape_response_cap_bytes: 2 * 1024 * 1024,
            scrape_cold_start_timeout: Duration::from_secs(5),

            aggregate_cache_ttl: Duration::from_secs(1),
            min_wall_time_for_throughput: Duration::from_micros(100),

            prometheus_bind: None,
            prometheus_per_client: false,

            dashboard_enabled: false,
            dashboard_tick: Duration::from_millis(500),
            metrics_tick: Duration::from_secs(1),

            run_duration: None,

            command_builder: Arc::new(crate::supervisor::command::NullCommandBuilder),
            origin_host: String::new(),
            segment_sizes_url: None,

            swarm_name: "hls-swarm".to_string(),
            swarm_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Precompute per-client ramp start offsets (`i/ramp_rate + jitter(i)`),
    /// so callers can assert jitter determinism without re-deriving the RNG
    /// sequence.
    pub fn ramp_plan(&self, target: u32) -> Vec<Duration> {
        (0..target)
            .map(|i| self.ramp_offset_for(i))
            .collect()
    }

    pub fn ramp_offset_for(&self, client_id: u32) -> Duration {
        let base = Duration::from_secs_f64(client_id as f64 / self.ramp_rate);
        base + crate::supervisor::backoff::seeded_jitter(
            self.config_seed,
            client_id,
            self.max_ramp_jitter,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_plan_is_deterministic() {
        let cfg = Config::new(10, Arc::new(crate::supervisor::command::NullCommandBuilder));
        let a = cfg.ramp_plan(10);
        let b = cfg.ramp_plan(10);
        assert_eq!(a, b);
    }

    #[test]
    fn ramp_plan_differs_across_seeds() {
        let mut cfg_a = Config::new(10, Arc::new(crate::supervisor::command::NullCommandBuilder));
        cfg_a.config_seed = 42;
        let mut cfg_b = cfg_a.clone();
        cfg_b.config_seed = 43;

        assert_ne!(cfg_a.ramp_plan(10), cfg_b.ramp_plan(10));
    }
}
