//! Single entry point for binaries: one setup, two roles.
//!
//! The same binary runs as master or worker. `Supervisor::run` checks the
//! environment the master gives its children and dispatches accordingly:
//! - master: claims the pid file, forks workers, handles signals
//! - worker: hosts the configured application servers

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use crate::config_watch::ConfigWatcher;
use crate::master::{ExecLauncher, MasterConfig, ProcessLauncher, run_master};
use crate::role;
use crate::socket::offset_port;
use crate::stats::RequestStats;
use crate::worker::{AppServer, WorkerConfig, run_worker};

/// Port offset of a worker's self-diagnostics endpoint from the serving port.
pub const DIAG_PORT_OFFSET: u16 = 1;
/// Port offset of the master's status endpoint from the serving port.
pub const STATUS_PORT_OFFSET: u16 = 2;

pub struct Supervisor {
    master: MasterConfig,
    worker: WorkerConfig,
    servers: Vec<Arc<dyn AppServer>>,
    stats: Arc<RequestStats>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    watcher: Option<Arc<dyn ConfigWatcher>>,
}

impl Supervisor {
    pub fn new(master: MasterConfig, worker: WorkerConfig) -> Self {
        Self {
            master,
            worker,
            servers: Vec::new(),
            stats: Arc::new(RequestStats::new()),
            launcher: None,
            watcher: None,
        }
    }

    /// Defaults for a service listening on `listen`: diagnostics on port +1, status on +2,
    /// pid file under `/var/run`.
    pub fn for_listen_addr(listen: SocketAddr) -> Self {
        let mut master = MasterConfig::new(MasterConfig::default_pid_path());
        if let Some(addr) = offset_port(listen, STATUS_PORT_OFFSET) {
            master = master.with_status_addr(addr);
        }
        let mut worker = WorkerConfig::new();
        if let Some(addr) = offset_port(listen, DIAG_PORT_OFFSET) {
            worker = worker.with_diag_addr(addr);
        }
        Self::new(master, worker)
    }

    pub fn with_server(mut self, server: Arc<dyn AppServer>) -> Self {
        self.servers.push(server);
        self
    }

    /// Counters the servers record into and the diagnostics endpoint reports.
    pub fn with_request_stats(mut self, stats: Arc<RequestStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Replace the default launcher, which re-executes the current binary.
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_config_watcher(mut self, watcher: Arc<dyn ConfigWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn master_config(&self) -> &MasterConfig {
        &self.master
    }

    pub fn worker_config(&self) -> &WorkerConfig {
        &self.worker
    }

    pub fn request_stats(&self) -> Arc<RequestStats> {
        Arc::clone(&self.stats)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if role::is_worker() {
            run_worker(self.worker, self.servers, self.stats)
                .await
                .context("worker failed")
        } else {
            let launcher = match self.launcher {
                Some(launcher) => launcher,
                None => Arc::new(
                    ExecLauncher::current_exe().context("failed to locate current executable")?,
                ),
            };
            run_master(self.master, launcher, self.watcher)
                .await
                .context("master failed")
        }
    }
}
