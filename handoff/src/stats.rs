//! Counters for observability endpoints.
//!
//! [`ForkStats`] lives in the master and counts fork attempts per reason.
//! [`RequestStats`] lives in each worker and rolls per-operation request counts into a
//! once-per-interval snapshot. Neither is read by control logic.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::role::ForkReason;

/// Fork attempts per [`ForkReason`], incremented before each launch.
#[derive(Debug, Default)]
pub struct ForkStats {
    start: AtomicU64,
    reload: AtomicU64,
    crash: AtomicU64,
}

impl ForkStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, reason: ForkReason) -> &AtomicU64 {
        match reason {
            ForkReason::Start => &self.start,
            ForkReason::Reload => &self.reload,
            ForkReason::Crash => &self.crash,
        }
    }

    pub fn record(&self, reason: ForkReason) {
        self.counter(reason).fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, reason: ForkReason) -> u64 {
        self.counter(reason).load(Ordering::Relaxed)
    }

    /// Reasons with no attempts are left out.
    pub fn snapshot(&self) -> ForkStatsSnapshot {
        let worker = ForkReason::ALL
            .into_iter()
            .map(|reason| (reason, self.count(reason)))
            .filter(|(_, n)| *n > 0)
            .collect();
        ForkStatsSnapshot { worker }
    }
}

/// Body of the master's `GET /stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForkStatsSnapshot {
    pub worker: BTreeMap<ForkReason, u64>,
}

/// Last rolled-up view of a worker's request counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestSnapshot {
    pub id: u32,
    pub qps: u64,
    pub method: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct RequestCounters {
    live: BTreeMap<String, u64>,
    last: RequestSnapshot,
}

/// Per-operation request counters for one worker process.
#[derive(Debug)]
pub struct RequestStats {
    pid: u32,
    inner: Mutex<RequestCounters>,
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStats {
    pub fn new() -> Self {
        Self::with_id(std::process::id())
    }

    pub fn with_id(pid: u32) -> Self {
        Self {
            pid,
            inner: Mutex::new(RequestCounters {
                live: BTreeMap::new(),
                last: RequestSnapshot {
                    id: pid,
                    ..Default::default()
                },
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequestCounters> {
        // Counters stay usable after a panicking holder; the worst case is a skewed count.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, method: &str) {
        let mut inner = self.lock();
        match inner.live.get_mut(method) {
            Some(n) => *n += 1,
            None => {
                inner.live.insert(method.to_string(), 1);
            }
        }
    }

    /// Roll live counts into the published snapshot and zero them.
    ///
    /// Operation names seen before stay in the map with a zero count, so the
    /// dashboard keeps a stable set of rows.
    pub fn calculate(&self) {
        let mut inner = self.lock();
        let method = inner.live.clone();
        let qps = method.values().sum();
        inner.live.values_mut().for_each(|n| *n = 0);
        inner.last = RequestSnapshot {
            id: self.pid,
            qps,
            method,
        };
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        self.lock().last.clone()
    }
}
