// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin surfaces: the local admin service, the admin proxy and the admin
//! link back to an origin repository.

pub mod link;
pub mod proxy;
pub mod service;
pub mod tls;

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::warn;

pub use link::{AdminLink, CommandHandler, LinkConnector, TcpAdminLink, TcpLinkConnector};
pub use proxy::AdminProxy;
pub use service::{AdminService, AdminState};
pub use tls::TlsOptions;

/// Errors from admin operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AdminError {
    /// TLS material could not be loaded or is inconsistent.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The admin link address is not a usable URL.
    #[error("Invalid link address: {0}")]
    InvalidAddress(String),

    /// The admin link handshake was rejected.
    #[error("Link handshake failed: {0}")]
    Handshake(String),

    /// The admin link request could not be sent.
    #[error("Link request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Wire protocol error on the admin link.
    #[error("Protocol error: {0}")]
    Protocol(#[from] conduit_protocol::FrameError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for admin operations.
pub type Result<T> = std::result::Result<T, AdminError>;

/// Listener options shared by the admin service and the admin proxy.
#[derive(Debug, Clone, Default)]
pub struct AdminOptions {
    /// Inbound TLS material.
    pub tls: TlsOptions,
    /// Set SO_REUSEPORT on the listener.
    pub reuse_port: bool,
}

/// Bind a TCP listener with address reuse. IPv6 wildcard binds accept IPv4
/// as well.
pub fn bind_tcp(addr: SocketAddr, reuse_port: bool) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        // Not every platform allows dual stack; a v6-only listener still works.
        let _ = socket.set_only_v6(false);
    }
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Pause after a failed `accept()` so a persistent error (EMFILE) does not
/// spin the accept loop.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Log a failed accept and wait before the next attempt.
pub(crate) async fn accept_backoff(surface: &'static str, error: &std::io::Error) {
    warn!(surface, error = %error, "Accept failed, backing off");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}
