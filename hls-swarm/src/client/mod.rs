//! Client Manager: owns every client's
//! Supervisor and ClientStats, and the registry the Aggregator reads.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::parser::SegmentSizeLookup;
use crate::stats::ClientStats;
use crate::supervisor::Supervisor;

/// One running (or previously running) client: its Supervisor and its
/// ClientStats, owned together.
pub struct Client {
    pub supervisor: Arc<Supervisor>,
    pub stats: Arc<ClientStats>,
}

/// Owns every client's Supervisor and ClientStats; the single owning
/// registry in the ownership graph. The Aggregator only ever
/// holds non-owning `Arc` clones obtained through `iter()`.
pub struct ClientManager {
    clients: DashMap<u32, Client>,
    config: Arc<Config>,
    size_lookup: Arc<dyn SegmentSizeLookup>,
}

impl ClientManager {
    pub fn new(config: Arc<Config>, size_lookup: Arc<dyn SegmentSizeLookup>) -> Self {
        Self {
            clients: DashMap::new(),
            config,
            size_lookup,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Instantiate and start client `client_id` as an independent unit
    ///. Registration happens synchronously so the
    /// Aggregator can observe it on the very next snapshot.
    pub fn start_client(&self, client_id: u32, cancel: CancellationToken) {
        let stats = Arc::new(ClientStats::new(client_id, self.config.min_wall_time_for_throughput));
        let supervisor = Supervisor::new(client_id, self.config.clone(), stats.clone(), self.size_lookup.clone());

        self.clients.insert(
            client_id,
            Client {
                supervisor: supervisor.clone(),
                stats,
            },
        );

        info!(client_id, "client started");
        tokio::spawn(async move {
            supervisor.run(cancel).await;
        });
    }

    /// Deregister a client. Does not stop it; callers stop before removing.
    pub fn remove_client(&self, client_id: u32) {
        self.clients.remove(&client_id);
    }

    /// Non-owning snapshot of every live client's stats, for the
    /// Aggregator.
    pub fn stats_refs(&self) -> Vec<Arc<ClientStats>> {
        self.clients.iter().map(|entry| entry.value().stats.clone()).collect()
    }

    pub fn supervisors(&self) -> Vec<Arc<Supervisor>> {
        self.clients.iter().map(|entry| entry.value().supervisor.clone()).collect()
    }

    /// Gracefully stop every client in parallel, waiting up to
    /// `config.graceful_stop_timeout` total for all of them.
    pub async fn shutdown_all(&self, overall_deadline: std::time::Duration) -> usize {
        let supervisors = self.supervisors();
        let stop_all = futures::future::join_all(
            supervisors.iter().map(|s| s.graceful_stop()),
        );

        let remaining = match tokio::time::timeout(overall_deadline, stop_all).await {
            Ok(_) => 0,
            Err(_) => {
                for supervisor in &supervisors {
                    if supervisor.state() != crate::supervisor::SupervisorState::Stopped {
                        supervisor.force_kill().await;
                    }
                }
                supervisors
                    .iter()
                    .filter(|s| s.state() != crate::supervisor::SupervisorState::Stopped)
                    .count()
            }
        };
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::command::NullCommandBuilder;

    struct NoopLookup;
    impl SegmentSizeLookup for NoopLookup {
        fn size_of(&self, _filename: &str) -> Option<u64> {
            None
        }
    }

    #[test]
    fn manager_starts_empty() {
        let config = Arc::new(Config::new(0, Arc::new(NullCommandBuilder)));
        let manager = ClientManager::new(config, Arc::new(NoopLookup));
        assert!(manager.is_empty());
    }
}
