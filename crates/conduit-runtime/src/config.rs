// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for conduit.
//!
//! Every option can be given on the command line or through a `CONDUIT_*`
//! environment variable (a `.env` file is honored by the binary).

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::admin::tls::TlsOptions;
use crate::mode::split_host_port;

/// Default admin port shared by the repository, the proxy and workers.
pub const DEFAULT_ADMIN_PORT: u16 = 6060;

/// Default admin bind host (any address, dual stack).
pub const DEFAULT_ADMIN_HOST: &str = "::";

/// Process configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "conduit",
    about = "Programmable network proxy runtime",
    disable_version_flag = true
)]
pub struct Config {
    /// Codebase source: file path, directory, http(s) URL or host:port.
    #[arg(env = "CONDUIT_SOURCE", default_value = "")]
    pub source: String,

    /// Treat SOURCE as an inline script instead of a path.
    #[arg(short = 'e', long, env = "CONDUIT_EVAL")]
    pub eval: bool,

    /// Load and verify the entry module, then exit.
    #[arg(long, env = "CONDUIT_VERIFY")]
    pub verify: bool,

    /// Print version information and exit.
    #[arg(short = 'v', long)]
    pub version: bool,

    /// Instance name reported in status and telemetry.
    #[arg(long, env = "CONDUIT_INSTANCE_NAME", default_value = "")]
    pub instance_name: String,

    /// Instance UUID (a random v4 UUID when absent).
    #[arg(long, env = "CONDUIT_INSTANCE_UUID")]
    pub instance_uuid: Option<String>,

    /// Admin port, as `port` or `host:port`.
    #[arg(long, env = "CONDUIT_ADMIN_PORT")]
    pub admin_port: Option<String>,

    /// Admin TLS certificate (PEM).
    #[arg(long, env = "CONDUIT_ADMIN_TLS_CERT")]
    pub admin_tls_cert: Option<PathBuf>,

    /// Admin TLS private key (PEM).
    #[arg(long, env = "CONDUIT_ADMIN_TLS_KEY")]
    pub admin_tls_key: Option<PathBuf>,

    /// Trusted client certificates for the admin port (PEM bundle).
    #[arg(long, env = "CONDUIT_ADMIN_TLS_TRUSTED")]
    pub admin_tls_trusted: Option<PathBuf>,

    /// Client certificate for fetching remote codebases (PEM).
    #[arg(long, env = "CONDUIT_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Client private key for fetching remote codebases (PEM).
    #[arg(long, env = "CONDUIT_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Trusted CA bundle for fetching remote codebases (PEM).
    #[arg(long, env = "CONDUIT_TLS_TRUSTED")]
    pub tls_trusted: Option<PathBuf>,

    /// Default log level (`RUST_LOG` takes precedence).
    #[arg(long, env = "CONDUIT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Set SO_REUSEPORT on admin listeners.
    #[arg(long, env = "CONDUIT_REUSE_PORT")]
    pub reuse_port: bool,

    /// Interpreter used by the process worker to run entry modules.
    #[arg(long, env = "CONDUIT_WORKER_COMMAND", default_value = "sh")]
    pub worker_command: String,

    /// Directory for materialized entry modules.
    #[arg(long, env = "CONDUIT_DATA_DIR", default_value = ".data")]
    pub data_dir: PathBuf,
}

impl Config {
    /// Admin address given on the command line, if any.
    ///
    /// A `host:port` value uses both parts (an empty host means any address);
    /// anything else must be a bare port number.
    pub fn admin_addr(&self) -> Result<Option<AdminAddr>, ConfigError> {
        self.admin_port
            .as_deref()
            .filter(|value| !value.is_empty())
            .map(AdminAddr::parse)
            .transpose()
    }

    /// Admin address to bind when a role always needs one.
    pub fn admin_addr_or_default(&self) -> Result<AdminAddr, ConfigError> {
        Ok(self.admin_addr()?.unwrap_or_default())
    }

    /// Instance UUID, generated when not configured.
    pub fn instance_uuid(&self) -> String {
        match self.instance_uuid.as_deref() {
            Some(uuid) if !uuid.is_empty() => uuid.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }

    /// TLS material for the admin service and admin proxy.
    pub fn admin_tls(&self) -> TlsOptions {
        TlsOptions {
            cert: self.admin_tls_cert.clone(),
            key: self.admin_tls_key.clone(),
            trusted: self.admin_tls_trusted.clone(),
        }
    }

    /// TLS material for outbound codebase fetches.
    pub fn fetch_tls(&self) -> TlsOptions {
        TlsOptions {
            cert: self.tls_cert.clone(),
            key: self.tls_key.clone(),
            trusted: self.tls_trusted.clone(),
        }
    }

    /// Default tracing directive derived from the configured log level.
    pub fn log_directive(&self) -> String {
        let level = self.log_level.to_ascii_lowercase();
        format!("conduit_runtime={level},conduit_protocol={level},conduit={level}")
    }
}

/// Admin bind address: a host (name or IP literal) and a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminAddr {
    pub host: String,
    pub port: u16,
}

impl Default for AdminAddr {
    fn default() -> Self {
        Self {
            host: DEFAULT_ADMIN_HOST.to_string(),
            port: DEFAULT_ADMIN_PORT,
        }
    }
}

impl AdminAddr {
    /// Parse `host:port` or a bare port.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        if let Some((host, port)) = split_host_port(value) {
            let host = if host.is_empty() {
                DEFAULT_ADMIN_HOST
            } else {
                host
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        let port: u16 = value
            .parse()
            .map_err(|_| ConfigError::InvalidAdminAddr(value.to_string()))?;
        Ok(Self {
            host: DEFAULT_ADMIN_HOST.to_string(),
            port,
        })
    }

    /// Resolve to a socket address suitable for binding.
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve admin address {self}"),
                )
            })
    }
}

impl fmt::Display for AdminAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The admin port value is neither `host:port` nor a port number.
    #[error("invalid admin address: {0}")]
    InvalidAdminAddr(String),

    /// The codebase path does not exist.
    #[error("file or directory does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// Filesystem inspection failed.
    #[error("cannot inspect {}: {source}", .path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
