//! Orphan detection.
//!
//! A worker whose master died is re-parented by the OS. Comparing the parent pid with the
//! one recorded at fork time is enough to notice.

use std::time::Duration;

use tokio::time::MissedTickBehavior;

use super::WorkerError;

pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

pub fn parent_pid() -> u32 {
    nix::unistd::getppid().as_raw() as u32
}

/// Resolves with [`WorkerError::Orphaned`] the first time `ppid()` stops matching `expected`.
pub async fn watch_parent<F>(expected: u32, interval: Duration, mut ppid: F) -> WorkerError
where
    F: FnMut() -> u32,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let actual = ppid();
        if actual != expected {
            tracing::error!(expected, actual, "Master is gone, worker exiting");
            return WorkerError::Orphaned { expected, actual };
        }
    }
}
