//! Process role discrimination and the fork-time environment contract.
//!
//! The master re-executes its own binary for every worker. The child learns that it
//! is a worker, why it was forked, and who its master is from these variables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Set to `1` in every worker's environment.
pub const WORKER_ENV: &str = "HANDOFF_WORKER";
/// `start`, `reload` or `crash`.
pub const REASON_ENV: &str = "HANDOFF_FORK_REASON";
/// Decimal pid of the master, used for orphan detection.
pub const MASTER_PID_ENV: &str = "HANDOFF_MASTER_PID";

/// Why a worker was forked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkReason {
    /// Initial generation at master startup.
    Start,
    /// Replacement generation after a reload trigger.
    Reload,
    /// Respawn after a worker exited non-zero.
    Crash,
}

impl ForkReason {
    pub const ALL: [ForkReason; 3] = [Self::Start, Self::Reload, Self::Crash];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Reload => "reload",
            Self::Crash => "crash",
        }
    }
}

impl fmt::Display for ForkReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForkReason {
    type Err = RoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "reload" => Ok(Self::Reload),
            "crash" => Ok(Self::Crash),
            other => Err(RoleError::InvalidReason(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
    #[error("invalid fork reason {0:?}")]
    InvalidReason(String),
    #[error("invalid master pid {0:?}")]
    InvalidPid(String),
}

/// True when this process was launched by a master as a worker.
pub fn is_worker() -> bool {
    std::env::var(WORKER_ENV).as_deref() == Ok("1")
}

/// What a worker was told at fork time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEnv {
    pub reason: ForkReason,
    pub master_pid: u32,
}

impl WorkerEnv {
    pub fn from_env() -> Result<Self, RoleError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, RoleError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let reason = lookup(REASON_ENV)
            .ok_or(RoleError::Missing(REASON_ENV))?
            .parse()?;
        let pid = lookup(MASTER_PID_ENV).ok_or(RoleError::Missing(MASTER_PID_ENV))?;
        let master_pid = pid
            .trim()
            .parse()
            .map_err(|_| RoleError::InvalidPid(pid.clone()))?;
        Ok(Self { reason, master_pid })
    }

    /// Variables the master sets on a child's command line environment.
    pub fn vars(&self) -> [(&'static str, String); 3] {
        [
            (WORKER_ENV, "1".to_string()),
            (REASON_ENV, self.reason.as_str().to_string()),
            (MASTER_PID_ENV, self.master_pid.to_string()),
        ]
    }
}
