// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin proxy.
//!
//! Forwards every accepted admin connection byte-for-byte to an upstream
//! repository. Inbound connections may be TLS terminated; the upstream leg is
//! plain TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use super::{AdminOptions, Result, bind_tcp, tls};
use crate::config::AdminAddr;

struct Running {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Admin traffic forwarder.
pub struct AdminProxy {
    target: Arc<str>,
    running: Option<Running>,
}

impl AdminProxy {
    /// Create a closed proxy forwarding to `target` (`host:port`).
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: Arc::from(target.into()),
            running: None,
        }
    }

    /// Upstream `host:port`.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Address the proxy listens on, while open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Bind and start forwarding.
    pub async fn open(&mut self, addr: &AdminAddr, options: &AdminOptions) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let listener = bind_tcp(addr.resolve().await?, options.reuse_port)?;
        let local_addr = listener.local_addr()?;
        let acceptor = if options.tls.is_enabled() {
            Some(TlsAcceptor::from(tls::server_config(&options.tls)?))
        } else {
            None
        };

        let task = tokio::spawn(accept_loop(listener, acceptor, self.target.clone()));
        info!(addr = %local_addr, upstream = %self.target, "Admin proxy listening");
        self.running = Some(Running { local_addr, task });
        Ok(local_addr)
    }

    /// Stop accepting and drop every forwarded connection.
    pub async fn close(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
            let _ = running.task.await;
            info!(addr = %running.local_addr, "Admin proxy closed");
        }
    }
}

async fn accept_loop(listener: TcpListener, acceptor: Option<TlsAcceptor>, target: Arc<str>) {
    // Dropped with the loop, aborting every connection task.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let acceptor = acceptor.clone();
                    let target = target.clone();
                    connections.spawn(async move {
                        match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls) => forward(tls, peer, &target).await,
                                Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                            },
                            None => forward(stream, peer, &target).await,
                        }
                    });
                }
                Err(e) => super::accept_backoff("admin proxy", &e).await,
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn forward<S>(mut inbound: S, peer: SocketAddr, target: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(peer = %peer, upstream = target, error = %e, "Upstream connect failed");
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await {
        Ok((up, down)) => debug!(peer = %peer, up, down, "Proxied connection closed"),
        Err(e) => debug!(peer = %peer, error = %e, "Proxied connection failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_forwards_bytes_both_ways() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        let mut proxy = AdminProxy::new(upstream_addr.to_string());
        let addr = proxy
            .open(
                &AdminAddr {
                    host: "127.0.0.1".to_string(),
                    port: 0,
                },
                &AdminOptions::default(),
            )
            .await
            .unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        proxy.close().await;
        assert!(proxy.local_addr().is_none());
    }
}
