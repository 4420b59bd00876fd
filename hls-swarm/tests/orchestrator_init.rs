use std::sync::Arc;

use hls_swarm::config::Config;
use hls_swarm::supervisor::command::NullCommandBuilder;
use hls_swarm::Orchestrator;

#[test]
fn missing_origin_and_override_fails_init() {
    let config = Config::new(3, Arc::new(NullCommandBuilder));
    let err = Orchestrator::new(config).expect_err("no origin_host or override was set");
    assert!(err.to_string().contains("segment-sizes URL"));
}

#[test]
fn explicit_segment_sizes_url_allows_init_without_origin() {
    let mut config = Config::new(3, Arc::new(NullCommandBuilder));
    config.segment_sizes_url = Some("https://cdn.example/index.json".to_string());
    assert!(Orchestrator::new(config).is_ok());
}
