//! Orchestrator: top-level lifecycle — start sequence, ramp
//! scheduler, shutdown coordination, and ownership of the scraper,
//! client manager, aggregator, dashboard, and Prometheus server.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::client::ClientManager;
use crate::config::Config;
use crate::dashboard::{self, DashboardModel};
use crate::error::{Error, Result};
use crate::metrics::{self, prometheus::PrometheusExporter};
use crate::scraper::{resolve_segment_sizes_url, SegmentSizeScraper};
use crate::summary::ExitSummary;

pub struct Orchestrator {
    config: Arc<Config>,
    scraper: Arc<SegmentSizeScraper>,
    client_manager: Arc<ClientManager>,
    aggregator: Arc<Aggregator>,
    cancel: CancellationToken,
    dashboard_rx: std::sync::Mutex<Option<tokio::sync::watch::Receiver<DashboardModel>>>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let segment_sizes_url =
            resolve_segment_sizes_url(&config.origin_host, config.segment_sizes_url.as_deref())
                .ok_or_else(|| Error::Init("no segment-sizes URL could be resolved".to_string()))?;

        let scraper = Arc::new(
            SegmentSizeScraper::new(
                segment_sizes_url,
                config.scrape_window,
                config.scrape_request_timeout,
                config.scrape_response_cap_bytes,
            )
            .map_err(|e| Error::Init(format!("failed to build segment-size scraper: {e}")))?,
        );

        let client_manager = Arc::new(ClientManager::new(config.clone(), scraper.clone()));
        let aggregator = Arc::new(Aggregator::new(
            client_manager.clone(),
            config.aggregate_cache_ttl,
            config.stall_duration_threshold,
            Duration::from_secs(5),
        ));

        Ok(Self {
            config,
            scraper,
            client_manager,
            aggregator,
            cancel: CancellationToken::new(),
            dashboard_rx: std::sync::Mutex::new(None),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn dashboard(&self) -> Option<tokio::sync::watch::Receiver<DashboardModel>> {
        self.dashboard_rx.lock().unwrap().clone()
    }

    /// Run the full start sequence, ramp all clients, then block until
    /// cancellation (signal, configured duration, or embedding-host
    /// cancel) before shutting down.
    pub async fn run(&self) -> Result<ExitSummary> {
        // 1-2: start the scraper and bound-wait for its first refresh.
        let scraper = self.scraper.clone();
        let scraper_cancel = self.cancel.clone();
        let (interval, jitter) = (self.config.scrape_interval, self.config.scrape_jitter);
        tokio::spawn(async move {
            scraper.run(interval, jitter, scraper_cancel).await;
        });

        if !self
            .scraper
            .wait_for_first_refresh(self.config.scrape_cold_start_timeout)
            .await
        {
            warn!("segment-size scraper cold start timed out; throughput metrics may read zero until populated");
        }

        // 3: metrics-update loop.
        tokio::spawn(metrics::run_metrics_loop(
            self.aggregator.clone(),
            self.config.metrics_tick,
            self.cancel.clone(),
        ));

        // 4: dashboard loop, if enabled.
        if self.config.dashboard_enabled {
            let rx = dashboard::spawn_dashboard_loop(
                self.aggregator.clone(),
                self.client_manager.clone(),
                self.config.target_clients,
                self.config.dashboard_tick,
                self.cancel.clone(),
            );
            *self.dashboard_rx.lock().unwrap() = Some(rx);
        }

        // Prometheus HTTP server, if a bind address was configured.
        if let Some(addr) = self.config.prometheus_bind {
            let exporter = Arc::new(PrometheusExporter::new(
                self.aggregator.clone(),
                self.client_manager.clone(),
                self.config.target_clients,
                self.config.prometheus_per_client,
            ));
            let router = crate::metrics::prometheus::router(exporter);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                match tokio::net::TcpListener::bind(addr).await {
                    Ok(listener) => {
                        info!(%addr, "prometheus endpoint listening");
                        let serve = axum::serve(listener, router);
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            result = serve => {
                                if let Err(e) = result {
                                    warn!(error = %e, "prometheus server exited with error");
                                }
                            }
                        }
                    }
                    Err(e) => warn!(%addr, error = %e, "failed to bind prometheus endpoint"),
                }
            });
        }

        // 5: ramp.
        self.ramp().await;

        // 6: monitor signals/duration, then shut down.
        self.monitor_until_shutdown().await;
        let remaining = self
            .client_manager
            .shutdown_all(self.config.graceful_stop_timeout.mul_f64(1.5))
            .await;

        let snapshot = self.aggregator.get_aggregate();
        let summary = ExitSummary::build(&snapshot, &self.client_manager);

        if remaining > 0 {
            return Err(Error::ShutdownTimeout { remaining });
        }
        Ok(summary)
    }

    async fn ramp(&self) {
        for client_id in 0..self.config.target_clients {
            if self.cancel.is_cancelled() {
                break;
            }
            let offset = self.config.ramp_offset_for(client_id);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(offset.saturating_sub(ramp_elapsed_hint(client_id, &self.config))) => {}
            }
            self.client_manager.start_client(client_id, self.cancel.child_token());
        }
    }

    async fn monitor_until_shutdown(&self) {
        let signal_wait = wait_for_termination_signal();
        match self.config.run_duration {
            Some(duration) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(duration) => { info!("configured run duration elapsed"); }
                    _ = signal_wait => { info!("termination signal received"); }
                }
            }
            None => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = signal_wait => { info!("termination signal received"); }
                }
            }
        }
        self.cancel.cancel();
    }
}

/// Crude compensation for the time already spent ramping earlier clients:
/// since `ramp()` sleeps `offset` sequentially, client `i`'s remaining
/// wait is `offset(i)` minus the cumulative sleeps already performed for
/// clients `0..i`. We approximate using the non-jittered base schedule,
/// which is exact when jitter is small relative to `1/ramp_rate` and
/// merely slightly front- or back-loads ramp under larger jitter configs.
fn ramp_elapsed_hint(client_id: u32, config: &Config) -> Duration {
    if client_id == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64((client_id - 1) as f64 / config.ramp_rate)
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
