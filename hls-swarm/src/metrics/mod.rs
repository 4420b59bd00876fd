//! Metrics collection loop and the Prometheus export surface.

pub mod prometheus;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;

/// Drives the aggregate cache on a fixed cadence (default 1 s) so that
/// the TTL window lines up with this loop's own tick rather than with
/// whichever consumer happens to call first.
pub async fn run_metrics_loop(aggregator: Arc<Aggregator>, tick: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let _ = aggregator.get_aggregate();
            }
        }
    }
}
