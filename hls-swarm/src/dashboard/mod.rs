//! Dashboard data-model contract.
//!
//! This module only produces the model on a fixed cadence and publishes
//! it via a `watch` channel; it deliberately renders nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AggregatedSnapshot, PercentileSet};
use crate::client::ClientManager;

/// Per-client row a renderer would show (speed, drift, stall/degraded
/// flags) — intentionally just data, no layout.
#[derive(Debug, Clone)]
pub struct ClientRow {
    pub client_id: u32,
    pub speed: Option<f64>,
    pub drift_secs: f64,
    pub stalled: bool,
    pub degraded: bool,
    pub total_bytes: u64,
}

/// The full model a dashboard renderer consumes each tick.
#[derive(Debug, Clone)]
pub struct DashboardModel {
    pub active_clients: usize,
    pub target_clients: u32,
    pub requests_per_sec: f64,
    pub bytes_per_sec: f64,
    pub segment_latency: PercentileSet,
    pub throughput: PercentileSet,
    pub degraded_pipeline_count: usize,
    pub stalled_count: usize,
    pub peak_drop_ratio: f64,
    pub rows: Vec<ClientRow>,
}

impl DashboardModel {
    fn build(snapshot: &AggregatedSnapshot, client_manager: &ClientManager, target_clients: u32) -> Self {
        let rows = client_manager
            .stats_refs()
            .into_iter()
            .map(|stats| {
                let snap = stats.snapshot(Duration::from_secs(12));
                ClientRow {
                    client_id: snap.client_id,
                    speed: snap.speed,
                    drift_secs: snap.current_drift.as_secs_f64(),
                    stalled: snap.stalled,
                    degraded: snap.pipeline_degraded,
                    total_bytes: snap.total_bytes,
                }
            })
            .collect();

        Self {
            active_clients: snapshot.active_clients,
            target_clients,
            requests_per_sec: snapshot.instantaneous.requests_per_sec,
            bytes_per_sec: snapshot.instantaneous.bytes_per_sec,
            segment_latency: snapshot.segment_latency,
            throughput: snapshot.throughput,
            degraded_pipeline_count: snapshot.degraded_pipeline_count,
            stalled_count: snapshot.stalled_count,
            peak_drop_ratio: snapshot.peak_drop_ratio,
            rows,
        }
    }
}

/// Publish a fresh `DashboardModel` on every tick until cancelled. The
/// returned receiver is the model contract's consumer side; nothing in
/// this crate renders it.
pub fn spawn_dashboard_loop(
    aggregator: Arc<crate::aggregator::Aggregator>,
    client_manager: Arc<ClientManager>,
    target_clients: u32,
    tick: Duration,
    cancel: CancellationToken,
) -> watch::Receiver<DashboardModel> {
    let initial = DashboardModel {
        active_clients: 0,
        target_clients,
        requests_per_sec: 0.0,
        bytes_per_sec: 0.0,
        segment_latency: PercentileSet::default(),
        throughput: PercentileSet::default(),
        degraded_pipeline_count: 0,
        stalled_count: 0,
        peak_drop_ratio: 0.0,
        rows: Vec::new(),
    };
    let (tx, rx) = watch::channel(initial);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let snapshot = aggregator.get_aggregate();
                    let model = DashboardModel::build(&snapshot, &client_manager, target_clients);
                    if tx.send(model).is_err() {
                        break;
                    }
                }
            }
        }
    });

    rx
}
