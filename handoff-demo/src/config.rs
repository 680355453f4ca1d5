//! Demo settings from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use handoff::socket::{offset_port, resolve};
use handoff::{DIAG_PORT_OFFSET, MasterConfig, STATUS_PORT_OFFSET, WorkerConfig};

pub const LISTEN_ENV: &str = "HANDOFF_LISTEN";
pub const DIAG_ADDR_ENV: &str = "HANDOFF_DIAG_ADDR";
pub const STATUS_ADDR_ENV: &str = "HANDOFF_STATUS_ADDR";
pub const PID_FILE_ENV: &str = "HANDOFF_PID_FILE";
pub const WORKERS_ENV: &str = "HANDOFF_WORKERS";
pub const WATCH_FILE_ENV: &str = "HANDOFF_WATCH_FILE";

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid address {value:?}: {source}")]
    Address {
        var: &'static str,
        value: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{var}: expected a positive integer, got {value:?}")]
    Count { var: &'static str, value: String },
    #[error("no port above {0} for derived endpoints")]
    NoSidePort(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoConfig {
    pub listen: SocketAddr,
    pub diag_addr: SocketAddr,
    pub status_addr: SocketAddr,
    pub pid_file: PathBuf,
    pub workers: usize,
    pub watch_file: Option<PathBuf>,
}

impl DemoConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let addr = |var: &'static str, value: String| {
            resolve(&value).map_err(|source| ConfigError::Address { var, value, source })
        };

        let listen = addr(
            LISTEN_ENV,
            lookup(LISTEN_ENV).unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
        )?;
        let diag_addr = match lookup(DIAG_ADDR_ENV) {
            Some(value) => addr(DIAG_ADDR_ENV, value)?,
            None => offset_port(listen, DIAG_PORT_OFFSET).ok_or(ConfigError::NoSidePort(listen))?,
        };
        let status_addr = match lookup(STATUS_ADDR_ENV) {
            Some(value) => addr(STATUS_ADDR_ENV, value)?,
            None => {
                offset_port(listen, STATUS_PORT_OFFSET).ok_or(ConfigError::NoSidePort(listen))?
            }
        };

        let workers = match lookup(WORKERS_ENV) {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::Count { var: WORKERS_ENV, value }),
            },
            None => handoff::master::DEFAULT_WORKER_COUNT,
        };

        Ok(Self {
            listen,
            diag_addr,
            status_addr,
            pid_file: lookup(PID_FILE_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(MasterConfig::default_pid_path),
            workers,
            watch_file: lookup(WATCH_FILE_ENV).map(PathBuf::from),
        })
    }

    pub fn master(&self) -> MasterConfig {
        MasterConfig::new(&self.pid_file)
            .with_status_addr(self.status_addr)
            .with_workers(self.workers)
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig::new().with_diag_addr(self.diag_addr)
    }
}
