//! Echo service under the handoff supervisor.
//!
//! ```text
//! HANDOFF_LISTEN=127.0.0.1:8080 HANDOFF_PID_FILE=/tmp/demo.pid handoff-demo
//! kill -HUP $(cat /tmp/demo.pid)    # roll a new worker generation
//! kill -INT $(cat /tmp/demo.pid)    # drain and stop
//! ```

mod config;

use std::sync::Arc;

use axum::Router;
use axum::extract::Path;
use axum::routing::{get, post};
use handoff::{FileWatcher, HttpServer, RequestStats, Supervisor};

use crate::config::DemoConfig;

async fn hello() -> String {
    format!("hello from worker {}\n", std::process::id())
}

async fn echo(Path(message): Path<String>) -> String {
    message
}

async fn echo_body(body: String) -> String {
    body
}

fn router() -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/echo", post(echo_body))
        .route("/echo/{message}", get(echo))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    handoff::logging::init_tracing(env!("CARGO_CRATE_NAME"));

    let config = DemoConfig::from_env()?;
    tracing::debug!(?config, worker = handoff::is_worker(), "Loaded configuration");

    let stats = Arc::new(RequestStats::new());
    let server = HttpServer::new("echo", config.listen, router()).with_stats(Arc::clone(&stats));

    let mut supervisor = Supervisor::new(config.master(), config.worker())
        .with_request_stats(stats)
        .with_server(Arc::new(server));
    if let Some(path) = &config.watch_file {
        supervisor = supervisor.with_config_watcher(Arc::new(FileWatcher::new(path)));
    }

    supervisor.run().await
}
