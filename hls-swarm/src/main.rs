use std::ffi::OsString;
use std::sync::Arc;

use hls_swarm::config::Config;
use hls_swarm::supervisor::command::FfmpegStyleBuilder;
use hls_swarm::{logging, Orchestrator};
use tracing::{error, info};

/// Assembles a `Config` from the process environment. Flag/config-file
/// parsing is the embedding host's responsibility; this binary only
/// reads a handful of env vars so it can run standalone for smoke tests.
fn config_from_env() -> Config {
    let target_clients: u32 = std::env::var("HLS_SWARM_CLIENTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let executable = std::env::var("HLS_SWARM_CHILD_BIN").unwrap_or_else(|_| "ffmpeg".to_string());
    let builder = Arc::new(FfmpegStyleBuilder {
        executable: OsString::from(executable),
    });

    let mut config = Config::new(target_clients, builder);
    if let Ok(origin) = std::env::var("HLS_SWARM_ORIGIN") {
        config.origin_host = origin;
    }
    if let Ok(url) = std::env::var("HLS_SWARM_SEGMENT_SIZES_URL") {
        config.segment_sizes_url = Some(url);
    }
    if let Ok(bind) = std::env::var("HLS_SWARM_PROMETHEUS_BIND") {
        config.prometheus_bind = bind.parse().ok();
    }
    if std::env::var("HLS_SWARM_DASHBOARD").is_ok() {
        config.dashboard_enabled = true;
    }
    if let Ok(secs) = std::env::var("HLS_SWARM_RUN_SECONDS") {
        if let Ok(secs) = secs.parse::<u64>() {
            config.run_duration = Some(std::time::Duration::from_secs(secs));
        }
    }
    config
}

#[tokio::main]
async fn main() {
    logging::init_logging();

    let config = config_from_env();
    let orchestrator = match Orchestrator::new(config) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "initialization failed");
            std::process::exit(1);
        }
    };

    match orchestrator.run().await {
        Ok(summary) => {
            println!("{summary}");
            info!("shutdown complete");
        }
        Err(e) => {
            error!(error = %e, "shutdown did not complete cleanly");
            std::process::exit(1);
        }
    }
}
