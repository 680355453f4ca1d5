//! handoff: master/worker process supervisor with zero-downtime worker handoff.
//!
//! A master process forks workers that each bind the serving address with
//! `SO_REUSEPORT`. On reload the master forks a new generation. Once a new worker is
//! listening it announces `Takeover`, and the master tells the old generation to drain
//! and exit.

pub mod bridge;
pub mod config_watch;
pub mod logging;
pub mod master;
pub mod pidfile;
pub mod role;
pub mod socket;
pub mod stats;
mod supervisor;
pub mod transport;
pub mod worker;

pub use config_watch::{ConfigWatcher, FileWatcher};
pub use master::{Master, MasterConfig, MasterError, run_master};
pub use role::{ForkReason, is_worker};
pub use stats::{ForkStats, RequestStats};
pub use supervisor::{DIAG_PORT_OFFSET, STATUS_PORT_OFFSET, Supervisor};
pub use transport::HttpServer;
pub use worker::{AppServer, Registry, WorkerConfig, WorkerError, run_worker};
