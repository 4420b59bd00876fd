//! The Supervisor: one per client. Builds the child command,
//! coordinates the progress channel, spawns into its own process group,
//! monitors for exit, and restarts with backoff.

pub mod backoff;
pub mod command;
mod process_group;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ProgressMode};
use crate::parser::{EventParser, ProgressParser, SegmentSizeLookup};
use crate::pipeline::{Pipeline, PipelineHandle};
use crate::stats::ClientStats;

use backoff::BackoffState;

/// Supervisor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Created,
    Starting,
    Running,
    Backoff,
    Stopped,
}

fn encode(state: SupervisorState) -> u8 {
    match state {
        SupervisorState::Created => 0,
        SupervisorState::Starting => 1,
        SupervisorState::Running => 2,
        SupervisorState::Backoff => 3,
        SupervisorState::Stopped => 4,
    }
}

fn decode(value: u8) -> SupervisorState {
    match value {
        1 => SupervisorState::Starting,
        2 => SupervisorState::Running,
        3 => SupervisorState::Backoff,
        4 => SupervisorState::Stopped,
        _ => SupervisorState::Created,
    }
}

/// Outcome of one spawn-and-monitor cycle.
enum CycleOutcome {
    /// Shutdown was requested; the supervisor must terminate.
    ShutdownRequested,
    /// The command builder failed; this client is terminal.
    BuildError,
    /// The child exited; restart policy decides what happens next.
    Exited { exit_code: Option<i32>, uptime: Duration },
}

/// Runtime facts about the currently (or most recently) live child.
#[derive(Default)]
struct RunRecord {
    pgid: Option<u32>,
}

/// One Supervisor per client.
pub struct Supervisor {
    client_id: u32,
    config: Arc<Config>,
    stats: Arc<ClientStats>,
    size_lookup: Arc<dyn SegmentSizeLookup>,
    state: AtomicU8,
    backoff: std::sync::Mutex<BackoffState>,
    run: std::sync::Mutex<RunRecord>,
    progress_unavailable: std::sync::atomic::AtomicBool,
    restarts: AtomicU32,
    event_handle: AsyncMutex<Option<PipelineHandle>>,
    progress_handle: AsyncMutex<Option<PipelineHandle>>,
}

impl Supervisor {
    pub fn new(
        client_id: u32,
        config: Arc<Config>,
        stats: Arc<ClientStats>,
        size_lookup: Arc<dyn SegmentSizeLookup>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            backoff: std::sync::Mutex::new(BackoffState::new(config.config_seed, client_id)),
            config,
            stats,
            size_lookup,
            state: AtomicU8::new(encode(SupervisorState::Created)),
            run: std::sync::Mutex::new(RunRecord::default()),
            progress_unavailable: std::sync::atomic::AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            event_handle: AsyncMutex::new(None),
            progress_handle: AsyncMutex::new(None),
        })
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn state(&self) -> SupervisorState {
        decode(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(encode(state), Ordering::Relaxed);
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn progress_available(&self) -> bool {
        !self.progress_unavailable.load(Ordering::Relaxed)
    }

    /// Drive this client's lifecycle until `cancel` fires or the client is
    /// terminally stopped (build error, or max restarts reached).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                self.finish_shutdown().await;
                return;
            }

            self.set_state(SupervisorState::Starting);
            match self.spawn_and_monitor(&cancel).await {
                CycleOutcome::ShutdownRequested => {
                    self.finish_shutdown().await;
                    return;
                }
                CycleOutcome::BuildError => {
                    warn!(client_id = self.client_id, "client build failed, client terminal");
                    self.set_state(SupervisorState::Stopped);
                    return;
                }
                CycleOutcome::Exited { exit_code, uptime } => {
                    self.stats.on_restart(exit_code);
                    self.restarts.fetch_add(1, Ordering::Relaxed);

                    let reset = uptime >= self.config.backoff_reset_uptime || exit_code == Some(0);
                    let mut backoff = self.backoff.lock().unwrap();
                    if reset {
                        backoff.reset();
                    }
                    if let Some(max) = self.config.max_restarts {
                        if backoff.attempts() >= max {
                            warn!(
                                client_id = self.client_id,
                                attempts = backoff.attempts(),
                                "max restarts reached, client terminal"
                            );
                            drop(backoff);
                            self.set_state(SupervisorState::Stopped);
                            return;
                        }
                    }
                    let delay = backoff.next_delay(&self.config);
                    drop(backoff);

                    self.set_state(SupervisorState::Backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.finish_shutdown().await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn finish_shutdown(&self) {
        self.graceful_stop().await;
        self.set_state(SupervisorState::Stopped);
    }

    /// Build the command, coordinate the progress channel, spawn the
    /// child in its own process group, and monitor it to completion.
    async fn spawn_and_monitor(&self, cancel: &CancellationToken) -> CycleOutcome {
        let (progress_mode, progress_target, progress_setup) = self.prepare_progress_channel();

        let built = self.config.command_builder.build_command(
            self.client_id,
            &self.config.origin_host,
            progress_mode,
            &progress_target,
            &self.config.swarm_name,
            &self.config.swarm_version,
        );
        let built = match built {
            Ok(b) => b,
            Err(e) => {
                warn!(client_id = self.client_id, error = %e, "command builder failed");
                return CycleOutcome::BuildError;
            }
        };

        let mut cmd = Command::new(&built.executable);
        cmd.args(&built.args);
        for (k, v) in &built.env {
            cmd.env(k, v);
        }
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdout(if matches!(progress_mode, ProgressMode::Stdout) {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        });
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(false);
        process_group::prepare(&mut cmd);

        // Lifecycle coordination: the accept task must already
        // be polling before the child is spawned.
        if let Some(ready_rx) = progress_setup.ready_rx {
            let _ = ready_rx.await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(client_id = self.client_id, error = %e, "spawn failed, treating as crash");
                return CycleOutcome::Exited {
                    exit_code: None,
                    uptime: Duration::ZERO,
                };
            }
        };

        let pgid = child.id().unwrap_or(0);
        self.run.lock().unwrap().pgid = Some(pgid);
        self.set_state(SupervisorState::Running);
        info!(client_id = self.client_id, pgid, "client running");

        // Event pipeline: child stderr, always.
        if let Some(stderr) = child.stderr.take() {
            self.spawn_event_pipeline(stderr).await;
        }

        // Progress pipeline: either the accepted socket connection, or
        // stdout if that's the chosen transport.
        #[cfg(unix)]
        {
            if let ProgressMode::UnixSocket = progress_mode {
                if let Some(accept_task) = progress_setup.accept_task {
                    match tokio::time::timeout(self.config.progress_grace_window, accept_task).await
                    {
                        Ok(Ok(Ok(stream))) => {
                            let (reader, _writer) = tokio::io::split(stream);
                            self.spawn_progress_pipeline(reader).await;
                            self.progress_unavailable.store(false, Ordering::Relaxed);
                        }
                        _ => {
                            debug!(client_id = self.client_id, "progress socket unavailable, continuing without it");
                            self.progress_unavailable.store(true, Ordering::Relaxed);
                        }
                    }
                }
                if let Some(path) = &progress_setup.socket_path {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        if let ProgressMode::Stdout = progress_mode {
            if let Some(stdout) = child.stdout.take() {
                self.spawn_progress_pipeline(stdout).await;
            }
        }

        let started_at = Instant::now();
        let exit_status = tokio::select! {
            _ = cancel.cancelled() => {
                self.drain_pipelines().await;
                self.graceful_stop().await;
                return CycleOutcome::ShutdownRequested;
            }
            status = child.wait() => status,
        };

        self.drain_pipelines().await;
        self.run.lock().unwrap().pgid = None;

        let uptime = started_at.elapsed();
        let exit_code = match exit_status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(client_id = self.client_id, error = %e, "error waiting on child");
                None
            }
        };

        CycleOutcome::Exited { exit_code, uptime }
    }

    async fn spawn_event_pipeline<R>(&self, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let pipeline = Pipeline::new(
            "event",
            self.config.pipeline_capacity,
            self.config.pipeline_drop_threshold,
        );
        let stats = self.stats.clone();
        let event_parser = Arc::new(EventParser::new(
            self.config.inflight_request_ttl,
            self.size_lookup.clone(),
        ));
        let reader = tokio::io::BufReader::new(reader);
        let parse_handle = event_parser.clone();
        let handle = pipeline.spawn(reader, move |line| {
            parse_handle.parse_line(stats.as_ref(), &line);
        });

        // Periodically sweep hanging in-flight requests for the lifetime of this pipeline.
        let sweep_handle = event_parser;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            loop {
                interval.tick().await;
                sweep_handle.sweep_expired();
                if Arc::strong_count(&sweep_handle) <= 1 {
                    break;
                }
            }
        });

        *self.event_handle.lock().await = Some(handle);
    }

    async fn spawn_progress_pipeline<R>(&self, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let pipeline = Pipeline::new(
            "progress",
            self.config.pipeline_capacity,
            self.config.pipeline_drop_threshold,
        );
        let stats = self.stats.clone();
        let stall_threshold = self.config.stall_speed_threshold;
        let mut parser = ProgressParser::new();
        let reader = tokio::io::BufReader::new(reader);
        let handle = pipeline.spawn(reader, move |line| {
            if let Some(update) = parser.feed_line(&line) {
                stats.apply_progress(&update, stall_threshold);
            }
        });
        *self.progress_handle.lock().await = Some(handle);
    }

    async fn drain_pipelines(&self) {
        let timeout = self.config.pipeline_drain_timeout;
        if let Some(handle) = self.event_handle.lock().await.take() {
            if !handle.drain_with_timeout(timeout).await {
                warn!(client_id = self.client_id, "event pipeline drain timed out");
            }
        }
        if let Some(handle) = self.progress_handle.lock().await.take() {
            if !handle.drain_with_timeout(timeout).await {
                warn!(client_id = self.client_id, "progress pipeline drain timed out");
            }
        }
    }

    /// Set up the progress transport. On Unix with socket mode selected
    /// and a path within the platform length limit, creates the listener
    /// and begins `accept()` before returning — the caller awaits the
    /// readiness signal, then a small grace delay, before spawning the
    /// child.
    fn prepare_progress_channel(&self) -> (ProgressMode, String, ProgressSetup) {
        #[cfg(unix)]
        {
            if matches!(self.config.progress_mode, ProgressMode::UnixSocket) {
                let path = PathBuf::from(format!(
                    "/tmp/hls-swarm-{}-{}.sock",
                    std::process::id(),
                    self.client_id
                ));
                let path_str = path.to_string_lossy().into_owned();
                // Platform socket-path length limit, approx 104 bytes
                //.
                if path_str.len() <= 104 {
                    let _ = std::fs::remove_file(&path);
                    if let Ok(listener) = std::os::unix::net::UnixListener::bind(&path) {
                        listener.set_nonblocking(true).ok();
                        if let Ok(listener) = tokio::net::UnixListener::from_std(listener) {
                            let (ready_tx, ready_rx) = oneshot::channel();
                            let accept_task = tokio::spawn(async move {
                                let _ = ready_tx.send(());
                                listener.accept().await.map(|(stream, _)| stream)
                            });
                            return (
                                ProgressMode::UnixSocket,
                                path_str,
                                ProgressSetup {
                                    ready_rx: Some(ready_rx),
                                    accept_task: Some(accept_task),
                                    socket_path: Some(path),
                                },
                            );
                        }
                    }
                }
                debug!(
                    client_id = self.client_id,
                    "unix socket progress channel unavailable, falling back to stdout"
                );
            }
        }

        (ProgressMode::Stdout, "pipe:1".to_string(), ProgressSetup::default())
    }

    /// SIGTERM the process group; escalate to SIGKILL after the
    /// configured grace timeout.
    pub async fn graceful_stop(&self) {
        let pgid = self.run.lock().unwrap().pgid;
        let Some(pgid) = pgid else { return };

        #[cfg(unix)]
        {
            if let Err(e) = process_group::send_term(pgid) {
                if e.raw_os_error() != Some(libc_esrch()) {
                    warn!(client_id = self.client_id, error = %e, "SIGTERM to process group failed");
                }
            }
        }

        tokio::time::sleep(self.config.graceful_stop_timeout).await;

        // Best-effort: if the pgid slot hasn't been cleared by the monitor
        // loop observing exit, escalate.
        if self.run.lock().unwrap().pgid == Some(pgid) {
            self.force_kill().await;
        }
    }

    pub async fn force_kill(&self) {
        let pgid = self.run.lock().unwrap().pgid;
        let Some(pgid) = pgid else { return };
        #[cfg(unix)]
        {
            let _ = process_group::send_kill(pgid);
        }
    }
}

#[cfg(unix)]
fn libc_esrch() -> i32 {
    libc::ESRCH
}

#[cfg(unix)]
type AcceptTask = tokio::task::JoinHandle<std::io::Result<tokio::net::UnixStream>>;
#[cfg(not(unix))]
type AcceptTask = tokio::task::JoinHandle<std::io::Result<()>>;

#[derive(Default)]
struct ProgressSetup {
    ready_rx: Option<oneshot::Receiver<()>>,
    accept_task: Option<AcceptTask>,
    socket_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_encoding() {
        for state in [
            SupervisorState::Created,
            SupervisorState::Starting,
            SupervisorState::Running,
            SupervisorState::Backoff,
            SupervisorState::Stopped,
        ] {
            assert_eq!(decode(encode(state)), state);
        }
    }
}
