//! Worker process lifecycle.
//!
//! A worker starts its application servers one at a time, announces `Takeover` when it
//! replaces a previous generation, then waits for the master's `Quit`. Draining
//! deregisters every server, waits out the discovery grace period and closes them all
//! concurrently.

pub mod liveness;
pub mod server;
pub mod signals;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

pub use liveness::{LIVENESS_INTERVAL, parent_pid, watch_parent};
pub use server::{AppServer, DEREGISTER_SLACK, Registry, RegistryError, drain_grace};
pub use signals::ignore_signals;

use crate::bridge::{self, CodecError, ControlChannel, ControlMessage, ControlReader, MessageType};
use crate::role::{ForkReason, RoleError, WorkerEnv};
use crate::socket;
use crate::stats::RequestStats;
use crate::transport::http::{serve, worker_routes};

/// How often live request counts are rolled into the published snapshot.
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Self-diagnostics endpoint. `None` disables it.
    pub diag_addr: Option<SocketAddr>,
    pub liveness_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            diag_addr: None,
            liveness_interval: LIVENESS_INTERVAL,
            stats_interval: STATS_INTERVAL,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_diag_addr(mut self, addr: SocketAddr) -> Self {
        self.diag_addr = Some(addr);
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Role(#[from] RoleError),
    #[error("failed to open control channel: {0}")]
    Channel(#[source] io::Error),
    #[error("failed to bind diagnostics endpoint on {addr}: {source}")]
    DiagBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server {name} failed to start: {source}")]
    ServerStart {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("server {name} stopped unexpectedly: {source}")]
    ServerExited {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("master pid changed from {expected} to {actual}")]
    Orphaned { expected: u32, actual: u32 },
    #[error("failed to send takeover: {0}")]
    Takeover(#[source] CodecError),
    #[error("control channel read failed: {0}")]
    ControlRead(#[source] CodecError),
    #[error("control channel closed by master")]
    ControlClosed,
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

type ServeOutcome = (String, io::Result<()>);

fn serve_failure(joined: Result<ServeOutcome, JoinError>) -> (String, io::Error) {
    match joined {
        Ok((name, Err(e))) => (name, e),
        Ok((name, Ok(()))) => (name, io::Error::other("serve returned early")),
        Err(e) => (String::from("<unknown>"), io::Error::other(e)),
    }
}

pub struct Worker {
    config: WorkerConfig,
    env: WorkerEnv,
    servers: Vec<Arc<dyn AppServer>>,
    stats: Arc<RequestStats>,
    parent: fn() -> u32,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        env: WorkerEnv,
        servers: Vec<Arc<dyn AppServer>>,
        stats: Arc<RequestStats>,
    ) -> Self {
        Self {
            config,
            env,
            servers,
            stats,
            parent: parent_pid,
        }
    }

    /// Run until drained, or until the master disappears. Process signals are ignored
    /// throughout; only the master's `Quit` starts the drain.
    pub async fn run(self, channel: ControlChannel) -> Result<(), WorkerError> {
        let background = CancellationToken::new();
        let _stop_background = background.clone().drop_guard();

        ignore_signals(background.clone()).map_err(WorkerError::Signal)?;
        if let Some(addr) = self.config.diag_addr {
            self.start_diagnostics(addr, background.clone())?;
        }
        self.start_stats_rollup(background.clone());

        let orphaned = watch_parent(
            self.env.master_pid,
            self.config.liveness_interval,
            self.parent,
        );

        tokio::select! {
            err = orphaned => Err(err),
            result = self.lifecycle(channel) => result,
        }
    }

    fn start_diagnostics(&self, addr: SocketAddr, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let listener = socket::bind(addr).map_err(|source| WorkerError::DiagBind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| WorkerError::DiagBind { addr, source })?;
        let app = worker_routes(Arc::clone(&self.stats), local);
        tokio::spawn(async move {
            if let Err(e) = serve(listener, app, shutdown).await {
                tracing::warn!(error = %e, "Diagnostics endpoint failed");
            }
        });
        Ok(())
    }

    fn start_stats_rollup(&self, shutdown: CancellationToken) {
        let stats = Arc::clone(&self.stats);
        let period = self.config.stats_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => stats.calculate(),
                }
            }
        });
    }

    async fn lifecycle(&self, channel: ControlChannel) -> Result<(), WorkerError> {
        let (mut reader, mut writer) = channel.split();
        let mut serving: JoinSet<ServeOutcome> = JoinSet::new();

        for server in &self.servers {
            let (ready_tx, ready_rx) = oneshot::channel();
            let task_server = Arc::clone(server);
            serving.spawn(async move {
                let result = task_server.serve(ready_tx).await;
                (task_server.name().to_string(), result)
            });

            let addr = match ready_rx.await {
                Ok(addr) => addr,
                Err(_) => {
                    let (_, source) = match serving.join_next().await {
                        Some(joined) => serve_failure(joined),
                        None => (String::new(), io::Error::other("serve task vanished")),
                    };
                    let err = WorkerError::ServerStart {
                        name: server.name().to_string(),
                        source,
                    };
                    self.drain().await;
                    return Err(err);
                }
            };
            tracing::info!(server = server.name(), %addr, "Server listening");

            if let Err(e) = server.register().await {
                tracing::warn!(server = server.name(), error = %e, "Failed to register server");
            }
        }

        let announced = match self.env.reason {
            ForkReason::Reload => bridge::channel::send(&mut writer, ControlMessage::takeover())
                .await
                .map_err(WorkerError::Takeover)
                .inspect(|()| tracing::info!("Sent takeover to master")),
            ForkReason::Start | ForkReason::Crash => Ok(()),
        };
        tracing::info!(pid = std::process::id(), reason = %self.env.reason, "Worker started");

        let outcome = match announced {
            Ok(()) => wait_for_quit(&mut reader, &mut serving).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Worker stopping on error");
        }

        self.drain().await;
        while let Some(joined) = serving.join_next().await {
            match joined {
                Ok((name, Ok(()))) => tracing::debug!(server = %name, "Server stopped"),
                other => {
                    let (name, e) = serve_failure(other);
                    tracing::warn!(server = %name, error = %e, "Server stopped with error");
                }
            }
        }
        tracing::info!(pid = std::process::id(), "Worker exiting");
        outcome
    }

    /// Deregister, wait the grace period and close every server concurrently.
    async fn drain(&self) {
        let drains = self.servers.iter().map(|server| async move {
            if let Err(e) = server.deregister().await {
                tracing::warn!(server = server.name(), error = %e, "Failed to deregister server");
            }
            let grace = drain_grace(server.lease());
            if !grace.is_zero() {
                tracing::info!(
                    server = server.name(),
                    grace_ms = grace.as_millis() as u64,
                    "Waiting for deregistration to propagate"
                );
                tokio::time::sleep(grace).await;
            }
            server.close().await;
        });
        futures::future::join_all(drains).await;
    }
}

/// Read control messages until `Quit`. A server exiting on its own ends the wait too.
async fn wait_for_quit(
    reader: &mut ControlReader,
    serving: &mut JoinSet<ServeOutcome>,
) -> Result<(), WorkerError> {
    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(msg)) if msg.kind == MessageType::Quit => {
                    tracing::info!("Received quit from master");
                    return Ok(());
                }
                Some(Ok(msg)) => {
                    tracing::warn!(kind = %msg.kind, "Ignoring unexpected control message");
                }
                Some(Err(e)) => return Err(WorkerError::ControlRead(e)),
                None => return Err(WorkerError::ControlClosed),
            },
            Some(joined) = serving.join_next() => {
                let (name, source) = serve_failure(joined);
                return Err(WorkerError::ServerExited { name, source });
            }
        }
    }
}

/// Worker entry point: read the fork-time environment and inherited channel, then run.
pub async fn run_worker(
    config: WorkerConfig,
    servers: Vec<Arc<dyn AppServer>>,
    stats: Arc<RequestStats>,
) -> Result<(), WorkerError> {
    let env = WorkerEnv::from_env()?;
    let channel = ControlChannel::inherit().map_err(WorkerError::Channel)?;
    tracing::info!(
        pid = std::process::id(),
        reason = %env.reason,
        master_pid = env.master_pid,
        "Worker booting"
    );
    Worker::new(config, env, servers, stats).run(channel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ControlWriter;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Records lifecycle calls; `serve` blocks until `close`.
    struct FakeServer {
        name: String,
        lease: Option<Duration>,
        fail_start: bool,
        closed: Notify,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl FakeServer {
        fn new(name: &str, events: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                lease: None,
                fail_start: false,
                closed: Notify::new(),
                events: Arc::clone(events),
            }
        }

        fn log(&self, event: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:{event}", self.name));
        }
    }

    #[async_trait::async_trait]
    impl AppServer for FakeServer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn serve(&self, ready: oneshot::Sender<SocketAddr>) -> io::Result<()> {
            if self.fail_start {
                self.log("bind-failed");
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "taken"));
            }
            self.log("serve");
            let _ = ready.send("127.0.0.1:1".parse().unwrap());
            self.closed.notified().await;
            self.log("stopped");
            Ok(())
        }

        async fn register(&self) -> Result<(), RegistryError> {
            self.log("register");
            Ok(())
        }

        async fn deregister(&self) -> Result<(), RegistryError> {
            self.log("deregister");
            Ok(())
        }

        fn lease(&self) -> Option<Duration> {
            self.lease
        }

        async fn close(&self) {
            self.log("close");
            self.closed.notify_one();
        }
    }

    fn worker(reason: ForkReason, servers: Vec<Arc<dyn AppServer>>) -> Worker {
        let env = WorkerEnv {
            reason,
            master_pid: parent_pid(),
        };
        Worker::new(
            WorkerConfig::new(),
            env,
            servers,
            Arc::new(RequestStats::with_id(1)),
        )
    }

    fn events_of(events: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        events.lock().unwrap().clone()
    }

    async fn master_end() -> (ControlChannel, ControlReader, ControlWriter) {
        let (master, worker) = ControlChannel::pair().unwrap();
        let (reader, writer) = master.split();
        (worker, reader, writer)
    }

    #[tokio::test]
    async fn reload_worker_announces_takeover_then_drains_on_quit() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let servers: Vec<Arc<dyn AppServer>> = vec![
            Arc::new(FakeServer::new("a", &events)),
            Arc::new(FakeServer::new("b", &events)),
        ];
        let (channel, mut master_rx, mut master_tx) = master_end().await;
        let run = tokio::spawn(worker(ForkReason::Reload, servers).run(channel));

        let takeover = tokio::time::timeout(Duration::from_secs(5), master_rx.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(takeover.kind, MessageType::Takeover);
        // Takeover only after every server is listening and registered.
        assert_eq!(
            events_of(&events),
            vec!["a:serve", "a:register", "b:serve", "b:register"]
        );

        bridge::channel::send(&mut master_tx, ControlMessage::quit())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let events = events_of(&events);
        for name in ["a", "b"] {
            let pos = |e: &str| events.iter().position(|x| x == &format!("{name}:{e}")).unwrap();
            assert!(pos("deregister") < pos("close"));
            assert!(pos("close") < pos("stopped"));
        }
    }

    #[tokio::test]
    async fn start_worker_does_not_announce_takeover() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let servers: Vec<Arc<dyn AppServer>> = vec![Arc::new(FakeServer::new("a", &events))];
        let (channel, mut master_rx, mut master_tx) = master_end().await;
        let run = tokio::spawn(worker(ForkReason::Start, servers).run(channel));

        assert!(
            tokio::time::timeout(Duration::from_millis(200), master_rx.next())
                .await
                .is_err()
        );

        bridge::channel::send(&mut master_tx, ControlMessage::quit())
            .await
            .unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_channel_drains_then_fails() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let servers: Vec<Arc<dyn AppServer>> = vec![Arc::new(FakeServer::new("a", &events))];
        let (channel, master_rx, master_tx) = master_end().await;
        let run = tokio::spawn(worker(ForkReason::Start, servers).run(channel));

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(master_rx);
        drop(master_tx);

        let err = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, WorkerError::ControlClosed));
        assert!(events_of(&events).contains(&"a:stopped".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_lease_plus_slack_before_close() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut leased = FakeServer::new("a", &events);
        leased.lease = Some(Duration::from_secs(10));
        let servers: Vec<Arc<dyn AppServer>> = vec![Arc::new(leased)];
        let (channel, _master_rx, mut master_tx) = master_end().await;
        let run = tokio::spawn(worker(ForkReason::Start, servers).run(channel));

        tokio::time::sleep(Duration::from_millis(10)).await;
        bridge::channel::send(&mut master_tx, ControlMessage::quit())
            .await
            .unwrap();
        let quit_at = tokio::time::Instant::now();

        run.await.unwrap().unwrap();
        assert!(quit_at.elapsed() >= Duration::from_secs(11));
    }

    #[tokio::test]
    async fn failed_server_start_is_fatal() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut broken = FakeServer::new("b", &events);
        broken.fail_start = true;
        let servers: Vec<Arc<dyn AppServer>> = vec![
            Arc::new(FakeServer::new("a", &events)),
            Arc::new(broken),
        ];
        let (channel, _master_rx, _master_tx) = master_end().await;

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            worker(ForkReason::Start, servers).run(channel),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, WorkerError::ServerStart { ref name, .. } if name == "b"));
        assert!(events_of(&events).contains(&"a:close".to_string()));
    }

    #[tokio::test]
    async fn process_signals_do_not_stop_a_serving_worker() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let events = Arc::new(Mutex::new(Vec::new()));
        let servers: Vec<Arc<dyn AppServer>> = vec![Arc::new(FakeServer::new("a", &events))];
        let (channel, _master_rx, mut master_tx) = master_end().await;
        let run = tokio::spawn(worker(ForkReason::Start, servers).run(channel));

        // Handlers are in place before the first server starts.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !events_of(&events).contains(&"a:serve".to_string()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        for sig in [Signal::SIGINT, Signal::SIGHUP, Signal::SIGTERM, Signal::SIGUSR1] {
            kill(Pid::this(), sig).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!run.is_finished());
        assert!(!events_of(&events).contains(&"a:deregister".to_string()));

        bridge::channel::send(&mut master_tx, ControlMessage::quit())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(events_of(&events).contains(&"a:close".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_worker_stops_without_draining() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let servers: Vec<Arc<dyn AppServer>> = vec![Arc::new(FakeServer::new("a", &events))];
        let (channel, _master_rx, _master_tx) = master_end().await;
        let mut worker = worker(ForkReason::Start, servers);
        worker.parent = || 1;
        worker.env.master_pid = 4242;

        let err = worker.run(channel).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Orphaned {
                expected: 4242,
                actual: 1
            }
        ));
        assert!(!events_of(&events).contains(&"a:close".to_string()));
    }
}
