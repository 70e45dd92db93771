// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin link: push channel from a remote worker to its origin repository.
//!
//! # Session
//!
//! ```text
//! worker                                origin
//!   | GET /repo/app/<uuid> HTTP/1.1        |
//!   | Upgrade: conduit-link  ------------> |
//!   | <------------ 101 Switching Protocols|
//!   | Hello { path, instance_uuid } -----> |
//!   | <------------ Command { name, payload }
//!   | CommandAck { name, handled } ------> |
//!   | Data ("metrics\n" + report) -------> |
//! ```
//!
//! The link reconnects on its own. Every established session gets a new
//! connection id, which lets the sender notice a reconnection and send a full
//! telemetry report instead of a delta.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use conduit_protocol::{Command, CommandAck, Frame, FramedStream, Hello, MessageType};
use reqwest::StatusCode;
use reqwest::header::{CONNECTION, UPGRADE};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::tls::{self, TlsOptions};
use super::{AdminError, Result};

/// Upgrade token announced in the handshake.
pub const LINK_PROTOCOL: &str = "conduit-link";

/// Delay between reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Deadline for the TCP (and TLS) connect of one attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound messages buffered while the link is busy or reconnecting.
const OUTBOUND_CAPACITY: usize = 64;

/// Handler for inbound commands. Returns whether the command was recognized.
pub type CommandHandler = Arc<dyn Fn(&str, &Bytes) -> bool + Send + Sync>;

/// Admin link contract.
pub trait AdminLink: Send + Sync {
    /// Id of the current connection. Changes every time the link reconnects;
    /// 0 until the first session is established.
    fn connect(&self) -> u64;

    /// Queue `data` for delivery.
    fn send(&self, data: Bytes);

    /// Register a handler for inbound commands.
    fn register_command_handler(&self, handler: CommandHandler);

    /// Close the link for good.
    fn close(&self);
}

/// Opens admin links.
pub trait LinkConnector: Send + Sync {
    /// Open a link to `address`.
    fn open(&self, address: &str) -> Result<Box<dyn AdminLink>>;
}

/// Link address for an instance: the codebase locator with the instance UUID
/// appended as the last path segment.
pub fn link_address(url: &str, instance_uuid: &str) -> String {
    format!("{}/{}", url.trim_end_matches('/'), instance_uuid)
}

type Handlers = Arc<Mutex<Vec<CommandHandler>>>;

/// Run every handler; a command is handled when any handler recognizes it.
fn dispatch(handlers: &Handlers, name: &str, payload: &Bytes) -> bool {
    let handlers = handlers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    handlers
        .iter()
        .fold(false, |handled, handler| handler(name, payload) || handled)
}

/// Where a link connects, plus the HTTP/1.1 client that performs the upgrade.
#[derive(Clone)]
struct Target {
    url: reqwest::Url,
    authority: String,
    client: reqwest::Client,
}

impl Target {
    fn parse(address: &str, tls_options: &TlsOptions) -> Result<Self> {
        let url = reqwest::Url::parse(address)
            .map_err(|e| AdminError::InvalidAddress(format!("{address}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| AdminError::InvalidAddress(format!("{address}: missing host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AdminError::InvalidAddress(format!("{address}: missing port")))?;

        let mut builder = reqwest::Client::builder()
            .http1_only()
            .no_proxy()
            .connect_timeout(CONNECT_TIMEOUT);
        match url.scheme() {
            "https" => {
                let config = Arc::unwrap_or_clone(tls::client_config(tls_options)?);
                builder = builder.use_preconfigured_tls(config);
            }
            "http" => {}
            scheme => {
                return Err(AdminError::InvalidAddress(format!(
                    "{address}: unsupported scheme {scheme}"
                )));
            }
        }

        Ok(Self {
            authority: format!("{host}:{port}"),
            client: builder.build()?,
            url,
        })
    }
}

type LinkReader = FramedStream<ReadHalf<reqwest::Upgraded>>;
type LinkWriter = FramedStream<WriteHalf<reqwest::Upgraded>>;

/// TCP admin link with automatic reconnection.
pub struct TcpAdminLink {
    connection_id: Arc<AtomicU64>,
    handlers: Handlers,
    outbound: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl TcpAdminLink {
    /// Start linking to `address` (an `http` or `https` URL).
    pub fn spawn(address: &str, instance_uuid: &str, tls_options: &TlsOptions) -> Result<Self> {
        let target = Target::parse(address, tls_options)?;
        let connection_id = Arc::new(AtomicU64::new(0));
        let handlers: Handlers = Arc::new(Mutex::new(Vec::new()));
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let task = tokio::spawn(run_link(
            target,
            instance_uuid.to_string(),
            connection_id.clone(),
            handlers.clone(),
            outbound_rx,
        ));

        Ok(Self {
            connection_id,
            handlers,
            outbound,
            task,
        })
    }
}

impl AdminLink for TcpAdminLink {
    fn connect(&self) -> u64 {
        self.connection_id.load(Ordering::SeqCst)
    }

    fn send(&self, data: Bytes) {
        // Overflow is dropped without logging: log lines travel over this link.
        let _ = self.outbound.try_send(data);
    }

    fn register_command_handler(&self, handler: CommandHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn close(&self) {
        self.task.abort();
    }
}

impl Drop for TcpAdminLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_link(
    target: Target,
    instance_uuid: String,
    connection_id: Arc<AtomicU64>,
    handlers: Handlers,
    mut outbound: mpsc::Receiver<Bytes>,
) {
    let mut next_id = 1u64;
    loop {
        match establish(&target).await {
            Ok(stream) => {
                let id = next_id;
                next_id += 1;
                let result = run_session(
                    stream,
                    &target,
                    &instance_uuid,
                    id,
                    &connection_id,
                    &handlers,
                    &mut outbound,
                )
                .await;
                match result {
                    Ok(()) => return,
                    Err(e) => warn!(origin = %target.authority, error = %e, "Admin link lost"),
                }
            }
            Err(e) => debug!(origin = %target.authority, error = %e, "Admin link connect failed"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Connect and complete the upgrade handshake.
async fn establish(target: &Target) -> Result<reqwest::Upgraded> {
    let response = target
        .client
        .get(target.url.clone())
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, LINK_PROTOCOL)
        .send()
        .await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(AdminError::Handshake(format!(
            "origin answered {}",
            response.status()
        )));
    }
    Ok(response.upgrade().await?)
}

async fn run_session(
    stream: reqwest::Upgraded,
    target: &Target,
    instance_uuid: &str,
    id: u64,
    connection_id: &AtomicU64,
    handlers: &Handlers,
    outbound: &mut mpsc::Receiver<Bytes>,
) -> Result<()> {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedStream::new(read_half);
    let mut writer = FramedStream::new(write_half);

    writer
        .write_frame(&Frame::hello(&Hello {
            path: target.url.path().to_string(),
            instance_uuid: instance_uuid.to_string(),
        })?)
        .await?;
    connection_id.store(id, Ordering::SeqCst);
    info!(origin = %target.authority, connection_id = id, "Admin link established");

    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    tokio::select! {
        result = read_commands(&mut reader, handlers, ack_tx) => result,
        result = write_outbound(&mut writer, ack_rx, outbound) => result,
    }
}

async fn read_commands(
    reader: &mut LinkReader,
    handlers: &Handlers,
    acks: mpsc::UnboundedSender<CommandAck>,
) -> Result<()> {
    loop {
        let frame = reader.read_frame().await?;
        match frame.message_type {
            MessageType::Command => {
                let command: Command = frame.decode()?;
                let handled = dispatch(handlers, &command.name, &command.payload);
                debug!(command = %command.name, handled, "Admin link command");
                let _ = acks.send(CommandAck {
                    name: command.name,
                    handled,
                });
            }
            other => debug!(message_type = ?other, "Ignoring admin link frame"),
        }
    }
}

async fn write_outbound(
    writer: &mut LinkWriter,
    mut acks: mpsc::UnboundedReceiver<CommandAck>,
    outbound: &mut mpsc::Receiver<Bytes>,
) -> Result<()> {
    loop {
        tokio::select! {
            Some(ack) = acks.recv() => {
                writer.write_frame(&Frame::command_ack(&ack)?).await?;
            }
            data = outbound.recv() => match data {
                Some(data) => writer.write_frame(&Frame::data(data)?).await?,
                None => return Ok(()),
            },
        }
    }
}

/// Connector producing [`TcpAdminLink`]s.
#[derive(Debug, Clone)]
pub struct TcpLinkConnector {
    instance_uuid: String,
    tls: TlsOptions,
}

impl TcpLinkConnector {
    /// Create a connector identifying as `instance_uuid`.
    pub fn new(instance_uuid: impl Into<String>, tls: TlsOptions) -> Self {
        Self {
            instance_uuid: instance_uuid.into(),
            tls,
        }
    }
}

impl LinkConnector for TcpLinkConnector {
    fn open(&self, address: &str) -> Result<Box<dyn AdminLink>> {
        Ok(Box::new(TcpAdminLink::spawn(
            address,
            &self.instance_uuid,
            &self.tls,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_link_address() {
        assert_eq!(
            link_address("http://repo:6060/repo/app/", "u-1"),
            "http://repo:6060/repo/app/u-1"
        );
        assert_eq!(
            link_address("https://repo/app", "u-1"),
            "https://repo/app/u-1"
        );
    }

    #[test]
    fn test_target_parse() {
        let target =
            Target::parse("http://[::1]:6060/repo/app/u-1", &TlsOptions::default()).unwrap();
        assert_eq!(target.url.path(), "/repo/app/u-1");
        assert_eq!(target.authority, "[::1]:6060");

        let target = Target::parse("https://repo.example.com/app/u", &TlsOptions::default()).unwrap();
        assert_eq!(target.authority, "repo.example.com:443");

        assert!(matches!(
            Target::parse("ftp://repo/app", &TlsOptions::default()),
            Err(AdminError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_dispatch_runs_every_handler() {
        let handlers: Handlers = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        handlers.lock().unwrap().push(Arc::new(move |name, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            name == "reload"
        }));
        let counter = calls.clone();
        handlers.lock().unwrap().push(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        }));

        assert!(dispatch(&handlers, "reload", &Bytes::new()));
        assert!(!dispatch(&handlers, "restart", &Bytes::new()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_connect_is_zero_before_session() {
        let link = TcpAdminLink::spawn(
            "http://127.0.0.1:9/repo/app/u-1",
            "u-1",
            &TlsOptions::default(),
        )
        .unwrap();
        assert_eq!(link.connect(), 0);
        link.close();
    }
}
