//! Structured logging setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a global `tracing` subscriber: an `EnvFilter` defaulting to
/// `hls_swarm=info`, plus a compact formatter. Call once, from `main`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hls_swarm=info"));

    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("HLS_SWARM_LOG_JSON").is_ok() {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}
