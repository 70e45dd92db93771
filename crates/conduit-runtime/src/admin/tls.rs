// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TLS material for admin listeners.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::debug;

use super::{AdminError, Result};

/// Handshake deadline for a single inbound connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// PEM file locations for one TLS endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Certificate chain.
    pub cert: Option<PathBuf>,
    /// Private key.
    pub key: Option<PathBuf>,
    /// Trusted certificates for peer verification.
    pub trusted: Option<PathBuf>,
}

impl TlsOptions {
    /// Whether a certificate and key are both configured.
    pub fn is_enabled(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| AdminError::Tls(format!("cannot read {}: {e}", path.display())))
}

/// Parse every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AdminError::Tls(format!("{}: failed to parse certificates: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(AdminError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Parse the private key in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path)?;
    PrivateKeyDer::from_pem_slice(&pem)
        .map_err(|e| AdminError::Tls(format!("{}: failed to parse private key: {e}", path.display())))
}

/// Build a server configuration. Client certificates are required when a
/// trusted set is configured.
pub fn server_config(options: &TlsOptions) -> Result<Arc<ServerConfig>> {
    let (Some(cert), Some(key)) = (&options.cert, &options.key) else {
        return Err(AdminError::Tls(
            "certificate and private key are both required".to_string(),
        ));
    };
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| AdminError::Tls(format!("protocol versions: {e}")))?;

    let builder = match &options.trusted {
        Some(trusted) => {
            let roots = root_store(trusted)?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| AdminError::Tls(format!("client verifier error: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| AdminError::Tls(format!("server config error: {e}")))?;
    Ok(Arc::new(config))
}

fn root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| AdminError::Tls(format!("failed to add trusted certificate: {e}")))?;
    }
    Ok(roots)
}

/// Build a client configuration for outbound admin links. Servers are
/// verified against the trusted set; a certificate and key, when present,
/// are offered as the client identity.
pub fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>> {
    let roots = match &options.trusted {
        Some(trusted) => root_store(trusted)?,
        None => RootCertStore::empty(),
    };
    let builder =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| AdminError::Tls(format!("protocol versions: {e}")))?
            .with_root_certificates(roots);

    let config = match (&options.cert, &options.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| AdminError::Tls(format!("client config error: {e}")))?,
        _ => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// TCP listener that completes a TLS handshake before handing connections
/// to axum. Failed handshakes are logged and skipped.
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    /// Wrap `listener` with `config`.
    pub fn new(listener: TcpListener, config: Arc<ServerConfig>) -> Self {
        Self {
            listener,
            acceptor: TlsAcceptor::from(config),
        }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    super::accept_backoff("admin service", &e).await;
                    continue;
                }
            };
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream)).await {
                Ok(Ok(tls)) => return (tls, addr),
                Ok(Err(e)) => debug!(peer = %addr, error = %e, "TLS handshake failed"),
                Err(_) => debug!(peer = %addr, "TLS handshake timed out"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.listener.local_addr()
    }
}
