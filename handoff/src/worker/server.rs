//! Boundaries between the worker and the services it hosts.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

/// Extra time on top of the discovery lease before a deregistered server is closed.
pub const DEREGISTER_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
#[error("service registry error: {0}")]
pub struct RegistryError(pub String);

/// Service discovery client.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, key: &str, addr: SocketAddr) -> Result<(), RegistryError>;
    async fn deregister(&self, key: &str, addr: SocketAddr) -> Result<(), RegistryError>;
    /// How long a registration stays visible to clients after it stops being renewed.
    fn ttl(&self) -> Duration;
}

/// An application server hosted by a worker.
#[async_trait]
pub trait AppServer: Send + Sync {
    fn name(&self) -> &str;

    /// Bind, report the bound address on `ready`, then serve until [`AppServer::close`].
    ///
    /// Returning before `ready` fires is a startup failure.
    async fn serve(&self, ready: oneshot::Sender<SocketAddr>) -> io::Result<()>;

    async fn register(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn deregister(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    /// Discovery lease, if registered anywhere.
    fn lease(&self) -> Option<Duration> {
        None
    }

    /// Stop accepting new work. `serve` returns once in-flight work finished.
    async fn close(&self);
}

/// Wait between deregistering a server and closing it.
pub fn drain_grace(lease: Option<Duration>) -> Duration {
    lease.map_or(Duration::ZERO, |ttl| ttl + DEREGISTER_SLACK)
}
