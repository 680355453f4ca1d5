//! Worker table: one record per live worker pid.
//!
//! A record holds the worker's state and the sending side of its control channel
//! writer. Records are created on a successful fork and removed only by [`WorkerTable::sweep`]
//! after the exit watcher recorded a terminal state.

use std::fmt;
use std::process::ExitStatus;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::bridge::ControlMessage;

pub type Pid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Serving; the current generation.
    Alive,
    /// Marked for replacement; still serving until told to quit.
    Reload,
    /// Exited with status 0.
    Quit,
    /// Exited non-zero, killed by a signal, or its wait failed.
    Crash,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Quit | Self::Crash)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Reload => "reload",
            Self::Quit => "quit",
            Self::Crash => "crash",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker process ended, as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    /// Non-zero exit code, or `None` when killed by a signal or the wait itself failed.
    Failure(Option<i32>),
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            Self::Success
        } else {
            Self::Failure(status.code())
        }
    }

    pub fn state(self) -> WorkerState {
        match self {
            Self::Success => WorkerState::Quit,
            Self::Failure(_) => WorkerState::Crash,
        }
    }
}

#[derive(Debug)]
pub struct ProcessRecord {
    pub state: WorkerState,
    /// Feeds the pid's writer task. Sending never blocks.
    pub endpoint: mpsc::UnboundedSender<ControlMessage>,
}

/// Pids removed by one sweep, split by how they ended.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub crashed: Vec<Pid>,
    pub quit: Vec<Pid>,
}

#[derive(Debug, Default)]
pub struct WorkerTable {
    records: DashMap<Pid, ProcessRecord>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pid: Pid, endpoint: mpsc::UnboundedSender<ControlMessage>) {
        self.records.insert(
            pid,
            ProcessRecord {
                state: WorkerState::Alive,
                endpoint,
            },
        );
    }

    pub fn state(&self, pid: Pid) -> Option<WorkerState> {
        self.records.get(&pid).map(|r| r.state)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move every `Alive` worker to `Reload`. Returns the pids that moved.
    pub fn mark_reload(&self) -> Vec<Pid> {
        let mut marked = Vec::new();
        for mut entry in self.records.iter_mut() {
            if entry.state == WorkerState::Alive {
                entry.state = WorkerState::Reload;
                marked.push(*entry.key());
            }
        }
        marked.sort_unstable();
        marked
    }

    /// Record the OS-observed exit of `pid`. This is the only way into `Quit` or `Crash`.
    pub fn record_exit(&self, pid: Pid, exit: WorkerExit) -> Option<WorkerState> {
        let mut record = self.records.get_mut(&pid)?;
        record.state = exit.state();
        Some(record.state)
    }

    /// Queue `msg` for every worker whose state is in `states`. Returns how many were queued.
    ///
    /// A worker whose writer task is gone is logged and skipped.
    pub fn notify(&self, msg: &ControlMessage, states: &[WorkerState]) -> usize {
        let mut sent = 0;
        for entry in self.records.iter() {
            if !states.contains(&entry.state) {
                continue;
            }
            let pid = *entry.key();
            match entry.endpoint.send(msg.clone()) {
                Ok(()) => {
                    tracing::debug!(pid, kind = %msg.kind, state = %entry.state, "Queued control message");
                    sent += 1;
                }
                Err(_) => {
                    tracing::warn!(pid, kind = %msg.kind, "Control channel writer is gone");
                }
            }
        }
        sent
    }

    /// Drop every record in a terminal state.
    pub fn sweep(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        self.records.retain(|pid, record| match record.state {
            WorkerState::Crash => {
                outcome.crashed.push(*pid);
                false
            }
            WorkerState::Quit => {
                outcome.quit.push(*pid);
                false
            }
            WorkerState::Alive | WorkerState::Reload => true,
        });
        outcome.crashed.sort_unstable();
        outcome.quit.sort_unstable();
        outcome
    }

    /// Pid/state pairs ordered by pid.
    pub fn snapshot(&self) -> Vec<(Pid, WorkerState)> {
        let mut out: Vec<_> = self.records.iter().map(|r| (*r.key(), r.state)).collect();
        out.sort_unstable_by_key(|(pid, _)| *pid);
        out
    }
}
