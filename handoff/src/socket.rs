//! Reuse-capable TCP listeners.
//!
//! Both `SO_REUSEADDR` and `SO_REUSEPORT` are set before bind, so a new worker
//! generation can bind the exact address the previous generation is still
//! accepting on. The kernel spreads new connections across every open listener
//! until the old one closes.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

pub const LISTEN_BACKLOG: i32 = 128;

/// Bind a non-blocking std listener with address and port reuse enabled.
pub fn listen_reusable(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    tracing::debug!(%addr, "Bound reusable listener");
    Ok(socket.into())
}

/// Tokio variant of [`listen_reusable`]. Must be called inside a runtime.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::from_std(listen_reusable(addr)?)
}

/// Resolve `host:port` to the first matching socket address.
pub fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address {addr} did not resolve"),
        )
    })
}

/// Same host, port shifted by `offset`. Used to derive the diagnostics (+1)
/// and status (+2) addresses from the serving address.
pub fn offset_port(addr: SocketAddr, offset: u16) -> Option<SocketAddr> {
    let port = addr.port().checked_add(offset)?;
    Some(SocketAddr::new(addr.ip(), port))
}
