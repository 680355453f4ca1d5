//! Master process: forks workers, tracks their state, and swaps generations on reload.
//!
//! # Architecture
//!
//! ```text
//! signals / config watch ──► reload() ──► mark Alive→Reload, enqueue Reload × N
//!                                              │
//!                        fork queue ◄──────────┘◄── sweep (Crash → enqueue Crash)
//!                            │
//!                            ▼
//!                     fork controller ──► ProcessLauncher ──► adopt(pid)
//!                     (one at a time,                           ├─ writer task
//!                      cooldown after                           ├─ reader task (Takeover → Quit to Reload pids)
//!                      each attempt)                            └─ exit watcher (Quit / Crash)
//! ```
//!
//! Table entries are only removed by the sweep, after the exit watcher recorded the
//! OS-reported exit.

pub mod launcher;
pub mod table;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use launcher::{ExecLauncher, LaunchError, LaunchRequest, LaunchedWorker, ProcessLauncher};
pub use table::{Pid, ProcessRecord, SweepOutcome, WorkerExit, WorkerState, WorkerTable};

use crate::bridge::{ControlMessage, ControlReader, ControlWriter, MessageType};
use crate::config_watch::ConfigWatcher;
use crate::pidfile::{PidFile, PidFileError};
use crate::role::ForkReason;
use crate::stats::ForkStats;
use crate::transport::http::{master_routes, serve};

/// Minimum spacing between two fork attempts.
pub const FORK_COOLDOWN: Duration = Duration::from_secs(1);
/// How often terminal table entries are collected.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound on subscribing to the external config source.
pub const CONFIG_WATCH_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_WORKER_COUNT: usize = 1;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub pid_path: PathBuf,
    /// `GET /stats` endpoint. `None` disables it.
    pub status_addr: Option<SocketAddr>,
    pub workers: usize,
    pub fork_cooldown: Duration,
    pub sweep_interval: Duration,
    pub watch_timeout: Duration,
}

impl MasterConfig {
    pub fn new(pid_path: impl Into<PathBuf>) -> Self {
        Self {
            pid_path: pid_path.into(),
            status_addr: None,
            workers: DEFAULT_WORKER_COUNT,
            fork_cooldown: FORK_COOLDOWN,
            sweep_interval: SWEEP_INTERVAL,
            watch_timeout: CONFIG_WATCH_TIMEOUT,
        }
    }

    /// `/var/run/<program>.pid`, named after the running binary.
    pub fn default_pid_path() -> PathBuf {
        let program = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| String::from("handoff"));
        PathBuf::from("/var/run").join(format!("{program}.pid"))
    }

    pub fn with_status_addr(mut self, addr: SocketAddr) -> Self {
        self.status_addr = Some(addr);
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_fork_cooldown(mut self, cooldown: Duration) -> Self {
        self.fork_cooldown = cooldown;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    #[error("failed to bind status endpoint on {addr}: {source}")]
    StatusBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch initial worker: {0}")]
    Start(#[source] LaunchError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

/// State shared by the master's tasks.
struct Shared {
    pid: u32,
    workers: usize,
    table: WorkerTable,
    stats: Arc<ForkStats>,
    forks: mpsc::UnboundedSender<ForkReason>,
    /// One exit watcher per forked pid.
    watchers: TaskTracker,
    shutdown: CancellationToken,
}

impl Shared {
    fn request_fork(&self, reason: ForkReason) {
        if self.forks.send(reason).is_err() {
            tracing::warn!(%reason, "Fork controller stopped, dropping fork request");
        }
    }

    fn reload(&self) {
        // Mark first so a fast Takeover from the new generation finds its predecessors.
        let marked = self.table.mark_reload();
        tracing::info!(marked = marked.len(), workers = self.workers, "Reload triggered");
        for _ in 0..self.workers {
            self.request_fork(ForkReason::Reload);
        }
    }

    fn adopt(self: &Arc<Self>, worker: LaunchedWorker) {
        let LaunchedWorker { pid, channel, exit } = worker;
        let (reader, writer) = channel.split();
        let (endpoint, outbox) = mpsc::unbounded_channel();

        self.table.insert(pid, endpoint);
        tokio::spawn(write_control(pid, writer, outbox));
        tokio::spawn(read_control(Arc::clone(self), pid, reader));
        self.watchers.spawn(watch_exit(Arc::clone(self), pid, exit));
    }
}

/// Forward queued messages to one worker. Ends when the record is dropped or a write fails.
async fn write_control(
    pid: Pid,
    mut writer: ControlWriter,
    mut outbox: mpsc::UnboundedReceiver<ControlMessage>,
) {
    while let Some(msg) = outbox.recv().await {
        let kind = msg.kind;
        if let Err(e) = writer.send(msg).await {
            tracing::warn!(pid, %kind, error = %e, "Failed to write control message");
            break;
        }
        tracing::info!(pid, %kind, "Sent control message");
    }
    tracing::debug!(pid, "Control writer exiting");
}

async fn read_control(shared: Arc<Shared>, pid: Pid, mut reader: ControlReader) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(msg) => match msg.kind {
                MessageType::Takeover => {
                    let retired = shared
                        .table
                        .notify(&ControlMessage::quit(), &[WorkerState::Reload]);
                    tracing::info!(pid, retired, "Worker took over, retiring previous generation");
                }
                MessageType::Quit => {
                    tracing::warn!(pid, "Ignoring quit sent by worker");
                }
            },
            Err(e) => {
                tracing::warn!(pid, error = %e, "Control channel read failed");
                break;
            }
        }
    }
    tracing::debug!(pid, "Control reader exiting");
}

async fn watch_exit(shared: Arc<Shared>, pid: Pid, exit: BoxFuture<'static, io::Result<WorkerExit>>) {
    let exit = match exit.await {
        Ok(exit) => exit,
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to wait for worker");
            WorkerExit::Failure(None)
        }
    };
    match shared.table.record_exit(pid, exit) {
        Some(WorkerState::Quit) => tracing::info!(pid, "Worker exited"),
        Some(state) => tracing::warn!(pid, ?exit, %state, "Worker exited abnormally"),
        None => tracing::warn!(pid, ?exit, "Exit of unknown worker"),
    }
}

async fn run_fork_controller(
    shared: Arc<Shared>,
    launcher: Arc<dyn ProcessLauncher>,
    mut requests: mpsc::UnboundedReceiver<ForkReason>,
    cooldown: Duration,
    fatal: oneshot::Sender<MasterError>,
) {
    let mut fatal = Some(fatal);
    loop {
        let reason = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            reason = requests.recv() => match reason {
                Some(reason) => reason,
                None => break,
            },
        };

        shared.stats.record(reason);
        let request = LaunchRequest {
            reason,
            master_pid: shared.pid,
        };
        match launcher.launch(&request) {
            Ok(worker) => {
                tracing::info!(pid = worker.pid, %reason, "Forked worker");
                shared.adopt(worker);
            }
            Err(e) if reason == ForkReason::Start => {
                tracing::error!(%reason, error = %e, "Failed to launch worker");
                if let Some(tx) = fatal.take() {
                    let _ = tx.send(MasterError::Start(e));
                }
                break;
            }
            Err(e) => {
                tracing::warn!(%reason, error = %e, "Failed to launch worker, waiting for next trigger");
            }
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(cooldown) => {}
        }
    }
    tracing::debug!("Fork controller exiting");
}

async fn run_sweep(shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let SweepOutcome { crashed, quit } = shared.table.sweep();
        for pid in quit {
            tracing::debug!(pid, "Removed exited worker");
        }
        for pid in crashed {
            tracing::warn!(pid, "Removed crashed worker, requesting respawn");
            shared.request_fork(ForkReason::Crash);
        }
    }
}

async fn run_config_watch(shared: Arc<Shared>, watcher: Arc<dyn ConfigWatcher>, timeout: Duration) {
    let mut changes = match tokio::time::timeout(timeout, watcher.watch()).await {
        Ok(Ok(changes)) => changes,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Config watch unavailable, hot reload disabled");
            return;
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Config watch setup timed out, hot reload disabled"
            );
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            change = changes.recv() => match change {
                Some(()) => {
                    tracing::info!("Configuration changed");
                    shared.reload();
                }
                None => {
                    tracing::debug!("Config watch ended");
                    break;
                }
            },
        }
    }
}

/// A running master.
pub struct Master {
    shared: Arc<Shared>,
    pidfile: PidFile,
    status_addr: Option<SocketAddr>,
    controller: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    fatal: Option<oneshot::Receiver<MasterError>>,
}

impl Master {
    /// Claim the pid file, bind the status endpoint, and fork the initial workers.
    pub async fn start(
        config: MasterConfig,
        launcher: Arc<dyn ProcessLauncher>,
        watcher: Option<Arc<dyn ConfigWatcher>>,
    ) -> Result<Self, MasterError> {
        let pid = std::process::id();
        let pidfile = PidFile::create_with_pid(&config.pid_path, pid)?;

        let status = match config.status_addr {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .map_err(|source| MasterError::StatusBind { addr, source })?,
            ),
            None => None,
        };

        let (forks, requests) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pid,
            workers: config.workers,
            table: WorkerTable::new(),
            stats: Arc::new(ForkStats::new()),
            forks,
            watchers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        let mut tasks = Vec::new();
        let mut status_addr = None;
        if let Some(listener) = status {
            status_addr = listener.local_addr().ok();
            let app = master_routes(Arc::clone(&shared.stats));
            let shutdown = shared.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = serve(listener, app, shutdown).await {
                    tracing::warn!(error = %e, "Status endpoint failed");
                }
            }));
        }
        tasks.push(tokio::spawn(run_sweep(
            Arc::clone(&shared),
            config.sweep_interval,
        )));
        if let Some(watcher) = watcher {
            tasks.push(tokio::spawn(run_config_watch(
                Arc::clone(&shared),
                watcher,
                config.watch_timeout,
            )));
        }

        let (fatal_tx, fatal_rx) = oneshot::channel();
        let controller = tokio::spawn(run_fork_controller(
            Arc::clone(&shared),
            launcher,
            requests,
            config.fork_cooldown,
            fatal_tx,
        ));

        for _ in 0..config.workers {
            shared.request_fork(ForkReason::Start);
        }
        tracing::info!(pid, workers = config.workers, ?status_addr, "Master started");

        Ok(Self {
            shared,
            pidfile,
            status_addr,
            controller,
            tasks,
            fatal: Some(fatal_rx),
        })
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn table(&self) -> &WorkerTable {
        &self.shared.table
    }

    pub fn stats(&self) -> Arc<ForkStats> {
        Arc::clone(&self.shared.stats)
    }

    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    /// Replace every current worker with a new generation.
    pub fn reload(&self) {
        self.shared.reload();
    }

    /// Resolves if the master hit a fatal error after startup. Never resolves otherwise.
    pub async fn failed(&mut self) -> MasterError {
        let received = match self.fatal.as_mut() {
            Some(rx) => rx.await.ok(),
            None => None,
        };
        self.fatal = None;
        match received {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    async fn stop_tasks(&mut self) {
        self.shared.shutdown.cancel();
        if let Err(e) = (&mut self.controller).await {
            tracing::warn!(error = %e, "Fork controller task failed");
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Master task failed");
            }
        }
    }

    fn remove_pidfile(&mut self) {
        if let Err(e) = self.pidfile.remove() {
            tracing::warn!(path = %self.pidfile.path().display(), error = %e, "Failed to remove pid file");
        }
    }

    /// Stop forking, tell every live worker to quit, and wait for all of them to exit.
    pub async fn graceful_shutdown(mut self) {
        tracing::info!(workers = self.shared.table.len(), "Graceful shutdown");
        self.stop_tasks().await;

        let notified = self
            .shared
            .table
            .notify(&ControlMessage::quit(), &[WorkerState::Alive, WorkerState::Reload]);
        tracing::info!(notified, "Waiting for workers to exit");

        self.shared.watchers.close();
        self.shared.watchers.wait().await;
        self.remove_pidfile();
        tracing::info!("Master exiting");
    }

    /// Tear down without waiting for workers; they notice the master is gone on their own.
    pub async fn shutdown(mut self) {
        tracing::info!(workers = self.shared.table.len(), "Immediate shutdown");
        self.stop_tasks().await;
        self.remove_pidfile();
    }
}

/// Master entry point: start, then react to signals until shutdown.
///
/// SIGHUP reloads, SIGINT and SIGQUIT shut down gracefully, SIGTERM exits immediately.
pub async fn run_master(
    config: MasterConfig,
    launcher: Arc<dyn ProcessLauncher>,
    watcher: Option<Arc<dyn ConfigWatcher>>,
) -> Result<(), MasterError> {
    use tokio::signal::unix::{SignalKind, signal};

    let install = |kind| signal(kind).map_err(MasterError::Signal);
    let mut hangup = install(SignalKind::hangup())?;
    let mut interrupt = install(SignalKind::interrupt())?;
    let mut quit = install(SignalKind::quit())?;
    let mut terminate = install(SignalKind::terminate())?;

    let mut master = Master::start(config, launcher, watcher).await?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                tracing::info!(signal = "SIGHUP", "Received signal");
                master.reload();
            }
            _ = interrupt.recv() => {
                tracing::info!(signal = "SIGINT", "Received signal");
                master.graceful_shutdown().await;
                return Ok(());
            }
            _ = quit.recv() => {
                tracing::info!(signal = "SIGQUIT", "Received signal");
                master.graceful_shutdown().await;
                return Ok(());
            }
            _ = terminate.recv() => {
                tracing::info!(signal = "SIGTERM", "Received signal");
                master.shutdown().await;
                return Ok(());
            }
            err = master.failed() => {
                tracing::error!(error = %err, "Master failed");
                master.shutdown().await;
                return Err(err);
            }
        }
    }
}
