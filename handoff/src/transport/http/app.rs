//! Bundled axum application server.
//!
//! Binds through the reuse-capable socket factory, so a reloaded worker can listen on
//! the same address while its predecessor drains.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::server::serve;
use crate::socket;
use crate::stats::RequestStats;
use crate::worker::{AppServer, Registry, RegistryError};

/// An [`AppServer`] serving an axum [`Router`].
pub struct HttpServer {
    name: String,
    addr: SocketAddr,
    router: Router,
    stats: Option<Arc<RequestStats>>,
    registry: Option<Arc<dyn Registry>>,
    bound: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
}

impl HttpServer {
    pub fn new(name: impl Into<String>, addr: SocketAddr, router: Router) -> Self {
        Self {
            name: name.into(),
            addr,
            router,
            stats: None,
            registry: None,
            bound: OnceLock::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Count every routed request into `stats`, keyed by route path.
    pub fn with_stats(mut self, stats: Arc<RequestStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Address actually bound, once `serve` got that far.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    fn registration(&self) -> Option<(&Arc<dyn Registry>, SocketAddr)> {
        Some((self.registry.as_ref()?, self.local_addr()?))
    }
}

async fn count_requests(
    State(stats): State<Arc<RequestStats>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(path) = request.extensions().get::<MatchedPath>() {
        stats.record(path.as_str());
    }
    next.run(request).await
}

#[async_trait]
impl AppServer for HttpServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(&self, ready: oneshot::Sender<SocketAddr>) -> io::Result<()> {
        let listener = socket::bind(self.addr)?;
        let local = listener.local_addr()?;
        let _ = self.bound.set(local);

        let mut app = self.router.clone();
        if let Some(stats) = &self.stats {
            app = app.layer(middleware::from_fn_with_state(
                Arc::clone(stats),
                count_requests,
            ));
        }

        if ready.send(local).is_err() {
            tracing::debug!(server = %self.name, "Nobody waiting for ready");
        }
        serve(listener, app, self.shutdown.clone()).await
    }

    async fn register(&self) -> Result<(), RegistryError> {
        match self.registration() {
            Some((registry, addr)) => {
                registry.register(&self.name, addr).await?;
                tracing::info!(server = %self.name, %addr, "Registered with service discovery");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn deregister(&self) -> Result<(), RegistryError> {
        match self.registration() {
            Some((registry, addr)) => {
                registry.deregister(&self.name, addr).await?;
                tracing::info!(server = %self.name, %addr, "Deregistered from service discovery");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn lease(&self) -> Option<Duration> {
        self.registry.as_ref().map(|r| r.ttl())
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}
